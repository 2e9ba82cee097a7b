use chrono::{DateTime, Utc};

/// Source of wall-clock time.
///
/// Circuit breakers, escalation records and the liveness monitor read time
/// through this trait so tests can drive them with a simulated clock.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
