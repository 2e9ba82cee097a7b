use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// Workflow state
// ──────────────────────────────────────────────

/// Shared key/value state for one workflow run.
///
/// Steps receive an owned snapshot and hand back a [`StepOutput`]; only the
/// executor writes into the run's state, so concurrent steps never race on it.
/// Each node's result lands under `"<node>_result"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowState {
    data: HashMap<String, serde_json::Value>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state from initial data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Build a state from a JSON object. Non-object values yield an empty state.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(obj) => Self {
                data: obj.into_iter().collect(),
            },
            _ => Self::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Read a boolean flag. Missing or non-boolean values yield `None`.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Fold a step's output into the state: its updates first, then the
    /// result under `"<node>_result"`.
    pub fn apply_output(&mut self, node: &str, output: &StepOutput) {
        for (k, v) in &output.updates {
            self.data.insert(k.clone(), v.clone());
        }
        self.data.insert(result_key(node), output.result.clone());
    }

    /// Merge another state into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &WorkflowState) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// The state key a node's result is stored under.
pub fn result_key(node: &str) -> String {
    format!("{}_result", node)
}

/// What a step hands back: a result value plus state updates (the flags
/// guards read, e.g. `analysis_complete = true`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub updates: HashMap<String, serde_json::Value>,
}

impl StepOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            updates: HashMap::new(),
        }
    }

    /// Add a state update.
    pub fn with_update(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.updates.insert(key.into(), value);
        self
    }

    /// Set a boolean flag.
    pub fn with_flag(self, key: impl Into<String>, value: bool) -> Self {
        self.with_update(key, serde_json::Value::Bool(value))
    }
}

// ──────────────────────────────────────────────
// Execution vocabulary
// ──────────────────────────────────────────────

/// Recovery strategy applied by the recovery engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ImmediateRetry,
    ExponentialBackoff,
    CircuitBreaker,
    AlternativeAgent,
    FallbackDefault,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImmediateRetry => "immediate_retry",
            Self::ExponentialBackoff => "exponential_backoff",
            Self::CircuitBreaker => "circuit_breaker",
            Self::AlternativeAgent => "alternative_agent",
            Self::FallbackDefault => "fallback_default",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

/// Why a workflow run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// No node was ready.
    Completed,
    /// `max_iterations` reached with nodes still ready.
    IterationLimit,
    /// A node reached level-3 escalation and halting is enabled.
    Escalated,
    /// The run was cancelled between iterations.
    Cancelled,
}

// ──────────────────────────────────────────────
// Stuck issues
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Timeout,
    Blocked,
    InfiniteLoop,
    NoProgress,
    Deadlock,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Blocked => "blocked",
            Self::InfiniteLoop => "infinite_loop",
            Self::NoProgress => "no_progress",
            Self::Deadlock => "deadlock",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A step or workflow flagged by the liveness monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckIssue {
    pub issue_id: String,
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    /// Step name, or the workflow id for workflow-level issues.
    pub subject: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ──────────────────────────────────────────────
// Events
// ──────────────────────────────────────────────

/// Events emitted on the [`crate::EventBus`] during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: String,
        start_node: String,
    },
    NodeStarted {
        workflow_id: String,
        node: String,
        iteration: usize,
    },
    NodeCompleted {
        workflow_id: String,
        node: String,
        iteration: usize,
        recovery_applied: bool,
    },
    NodeFailed {
        workflow_id: String,
        node: String,
        iteration: usize,
        error: String,
    },
    NodeEscalated {
        workflow_id: String,
        node: String,
        task_id: String,
        error: String,
    },
    RecoveryAttempted {
        step: String,
        attempt: u32,
        strategy: RecoveryStrategy,
        success: bool,
        duration_ms: f64,
    },
    CircuitOpened {
        step: String,
        failure_count: u32,
    },
    StuckIssueDetected {
        issue: StuckIssue,
    },
    CheckpointSaved {
        workflow_id: String,
        checkpoint_id: String,
        iteration: usize,
    },
    WorkflowCompleted {
        workflow_id: String,
        completed_nodes: Vec<String>,
        total_iterations: usize,
        reason: TerminationReason,
    },
}

impl WorkflowEvent {
    /// Snake-case name of the variant, used as the JSONL `event_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeFailed { .. } => "node_failed",
            Self::NodeEscalated { .. } => "node_escalated",
            Self::RecoveryAttempted { .. } => "recovery_attempted",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::StuckIssueDetected { .. } => "stuck_issue_detected",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::WorkflowCompleted { .. } => "workflow_completed",
        }
    }
}
