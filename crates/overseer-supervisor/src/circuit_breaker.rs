use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use overseer_core::config::CircuitBreakerConfig;
use overseer_core::Clock;

/// Failure bookkeeping for one step name.
#[derive(Debug, Clone)]
struct BreakerState {
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    circuit_open: bool,
    reset_timeout: Duration,
}

impl BreakerState {
    fn new(reset_timeout: Duration) -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            circuit_open: false,
            reset_timeout,
        }
    }

    fn clear(&mut self) {
        self.failure_count = 0;
        self.circuit_open = false;
    }

    fn timed_out(&self, now: DateTime<Utc>) -> bool {
        match self.last_failure {
            // Negative elapsed time (clock moved backwards) never resets.
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed > self.reset_timeout)
                .unwrap_or(false),
            None => true,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub step: String,
    pub circuit_open: bool,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub reset_timeout_secs: u64,
}

/// Per-step circuit breakers, shared by every workflow run in a context.
///
/// A breaker opens once its failure count reaches the threshold and closes
/// again when `reset_timeout` has elapsed since the last failure. The close
/// happens inside [`CircuitBreakers::allow`], under the same lock as the read.
pub struct CircuitBreakers {
    threshold: u32,
    default_reset: Duration,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakers {
    pub fn new(config: &CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: config.threshold.max(1),
            default_reset: config.reset_timeout(),
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BreakerState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Register a breaker with its own reset timeout. Existing failure
    /// counts are kept.
    pub fn register(&self, step: &str, reset_timeout: Duration) {
        let mut states = self.lock();
        states
            .entry(step.to_string())
            .and_modify(|s| s.reset_timeout = reset_timeout)
            .or_insert_with(|| BreakerState::new(reset_timeout));
        debug!(step, reset_secs = reset_timeout.as_secs(), "Circuit breaker registered");
    }

    /// Register `step` with the configured reset timeout unless it already
    /// has a breaker.
    pub fn register_default(&self, step: &str) {
        let default_reset = self.default_reset;
        self.lock()
            .entry(step.to_string())
            .or_insert_with(|| BreakerState::new(default_reset));
    }

    /// Whether a request for `step` may proceed.
    ///
    /// Unknown steps are always allowed. An open breaker whose timeout has
    /// passed is closed and its failure count cleared.
    pub fn allow(&self, step: &str) -> bool {
        let now = self.clock.now();
        let mut states = self.lock();
        let Some(state) = states.get_mut(step) else {
            return true;
        };
        if !state.circuit_open {
            return true;
        }
        if state.timed_out(now) {
            state.clear();
            info!(step, "Circuit breaker closed after reset timeout");
            return true;
        }
        false
    }

    /// Count a failure for `step`. Returns true when this failure opened the
    /// circuit. Steps without a registered breaker are not tracked.
    pub fn record_failure(&self, step: &str) -> bool {
        let now = self.clock.now();
        let mut states = self.lock();
        let Some(state) = states.get_mut(step) else {
            return false;
        };
        state.failure_count += 1;
        state.last_failure = Some(now);

        if !state.circuit_open && state.failure_count >= self.threshold {
            state.circuit_open = true;
            warn!(step, failures = state.failure_count, "Circuit breaker opened");
            return true;
        }
        false
    }

    /// Close one breaker and clear its failure count.
    pub fn reset(&self, step: &str) {
        if let Some(state) = self.lock().get_mut(step) {
            state.clear();
        }
    }

    pub fn reset_all(&self) {
        for state in self.lock().values_mut() {
            state.clear();
        }
    }

    /// Open flag as stored, without applying the reset timeout.
    pub fn is_open(&self, step: &str) -> bool {
        self.lock().get(step).is_some_and(|s| s.circuit_open)
    }

    pub fn failure_count(&self, step: &str) -> u32 {
        self.lock().get(step).map(|s| s.failure_count).unwrap_or(0)
    }

    /// All breakers, sorted by step name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .lock()
            .iter()
            .map(|(step, s)| BreakerSnapshot {
                step: step.clone(),
                circuit_open: s.circuit_open,
                failure_count: s.failure_count,
                last_failure: s.last_failure,
                reset_timeout_secs: s.reset_timeout.as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.step.cmp(&b.step));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_test_utils::ManualClock;

    fn breakers(clock: Arc<ManualClock>) -> CircuitBreakers {
        CircuitBreakers::new(&CircuitBreakerConfig::default(), clock)
    }

    fn registered(clock: Arc<ManualClock>, steps: &[&str]) -> CircuitBreakers {
        let cb = breakers(clock);
        for step in steps {
            cb.register_default(step);
        }
        cb
    }

    #[test]
    fn test_unknown_step_is_allowed() {
        let cb = breakers(ManualClock::fixed());
        assert!(cb.allow("never_seen"));
        assert!(cb.snapshot().is_empty());
    }

    #[test]
    fn test_failures_of_unregistered_step_are_ignored() {
        let cb = breakers(ManualClock::fixed());
        for _ in 0..5 {
            assert!(!cb.record_failure("adhoc"));
        }
        assert!(cb.allow("adhoc"));
        assert_eq!(cb.failure_count("adhoc"), 0);
        assert!(cb.snapshot().is_empty());
    }

    #[test]
    fn test_register_default_keeps_custom_timeout() {
        let cb = breakers(ManualClock::fixed());
        cb.register("slow", Duration::from_secs(5));
        cb.register_default("slow");
        cb.register_default("fast");
        let snap = cb.snapshot();
        assert_eq!(snap[0].step, "fast");
        assert_eq!(snap[0].reset_timeout_secs, 60);
        assert_eq!(snap[1].reset_timeout_secs, 5);
    }

    #[test]
    fn test_opens_at_threshold_and_resets_after_timeout() {
        let clock = ManualClock::fixed();
        let cb = registered(clock.clone(), &["fetch"]);

        assert!(!cb.record_failure("fetch"));
        assert!(!cb.record_failure("fetch"));
        assert!(cb.allow("fetch"));
        assert!(cb.record_failure("fetch"));
        assert!(!cb.allow("fetch"));

        // Exactly at the timeout is still open; it must be exceeded.
        clock.advance_secs(60);
        assert!(!cb.allow("fetch"));

        clock.advance_secs(1);
        assert!(cb.allow("fetch"));
        assert_eq!(cb.failure_count("fetch"), 0);
        assert!(!cb.is_open("fetch"));
    }

    #[test]
    fn test_breakers_are_independent_per_step() {
        let cb = registered(ManualClock::fixed(), &["a", "b"]);
        for _ in 0..3 {
            cb.record_failure("a");
        }
        assert!(!cb.allow("a"));
        assert!(cb.allow("b"));
    }

    #[test]
    fn test_register_sets_custom_timeout() {
        let clock = ManualClock::fixed();
        let cb = breakers(clock.clone());
        cb.register("slow", Duration::from_secs(5));
        for _ in 0..3 {
            cb.record_failure("slow");
        }
        assert!(!cb.allow("slow"));
        clock.advance_secs(6);
        assert!(cb.allow("slow"));
    }

    #[test]
    fn test_reset_and_reset_all() {
        let cb = registered(ManualClock::fixed(), &["a", "b"]);
        for _ in 0..3 {
            cb.record_failure("a");
            cb.record_failure("b");
        }
        cb.reset("a");
        assert!(cb.allow("a"));
        assert!(!cb.allow("b"));

        cb.reset_all();
        assert!(cb.allow("b"));
        assert_eq!(cb.failure_count("b"), 0);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let cb = registered(ManualClock::fixed(), &["zeta", "alpha"]);
        cb.record_failure("zeta");
        cb.record_failure("alpha");
        let snap = cb.snapshot();
        assert_eq!(snap[0].step, "alpha");
        assert_eq!(snap[1].step, "zeta");
        assert_eq!(snap[1].failure_count, 1);
        assert!(snap[1].last_failure.is_some());
    }
}
