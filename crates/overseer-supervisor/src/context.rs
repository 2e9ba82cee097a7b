use std::sync::Arc;

use overseer_core::config::AppConfig;
use overseer_core::traits::CheckpointSink;
use overseer_core::{Clock, EventBus, SystemClock};

use crate::circuit_breaker::CircuitBreakers;
use crate::monitor::LivenessMonitor;

/// Collaborators shared by every workflow run in a process.
///
/// Circuit breakers and the monitor are global per step name, so runs that
/// share a context share breaker state. Everything else lives in the run.
#[derive(Clone)]
pub struct SupervisorContext {
    pub clock: Arc<dyn Clock>,
    pub breakers: Arc<CircuitBreakers>,
    pub event_bus: Arc<EventBus>,
    pub monitor: Option<Arc<LivenessMonitor>>,
    pub checkpoints: Option<Arc<dyn CheckpointSink>>,
}

impl SupervisorContext {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a context around a specific clock. Tests pass a manual clock
    /// here so breaker timeouts and monitor thresholds are deterministic.
    pub fn with_clock(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: Arc::new(CircuitBreakers::new(&config.circuit_breaker, clock.clone())),
            event_bus: Arc::new(EventBus::default()),
            monitor: None,
            checkpoints: None,
            clock,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<LivenessMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_checkpoints(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoints = Some(sink);
        self
    }

    /// Build the monitor described by `config.monitor`, wired to this
    /// context's clock and event bus, and attach it.
    pub fn with_configured_monitor(self, config: &AppConfig) -> Self {
        let monitor = LivenessMonitor::new(config.monitor.clone(), self.clock.clone())
            .with_event_bus(self.event_bus.clone());
        self.with_monitor(Arc::new(monitor))
    }
}
