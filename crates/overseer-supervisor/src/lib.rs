pub mod checkpoint;
pub mod circuit_breaker;
pub mod context;
pub mod definition;
pub mod escalation;
pub mod graph;
pub mod monitor;
pub mod recovery;
pub mod run_log;
pub mod step;

pub use checkpoint::{CheckpointStore, SessionSummary};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreakers};
pub use context::SupervisorContext;
pub use definition::WorkflowFile;
pub use escalation::{BlockedTask, EscalationHandler, EscalationLevel, EscalationOutcome, EscalationRecord};
pub use graph::{Edge, Executor, GuardRegistry, GuardRule, LogEntry, LogStatus, NodeRecord, WorkflowGraph, WorkflowResult};
pub use monitor::{IssueRouter, IssueSummary, LivenessMonitor};
pub use recovery::{ExecutionOutcome, OutcomeStatus, RecoveryAttempt, RecoveryEngine, RecoveryStats};
pub use run_log::RunLogger;
pub use step::{CommandStep, StepRegistry};
