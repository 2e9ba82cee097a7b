use serde::Serialize;

use overseer_core::types::{NodeStatus, StepOutput, WorkflowState};

/// Per-run record of one graph node.
///
/// Created `Pending` when the run starts and updated by the executor on every
/// dispatch. Records are never removed within a run.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub name: String,
    pub status: NodeStatus,
    /// State snapshot the node last ran with.
    pub input: Option<WorkflowState>,
    pub output: Option<StepOutput>,
    pub error: Option<String>,
    /// Times the node was dispatched in this run.
    pub attempts: u32,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Pending,
            input: None,
            output: None,
            error: None,
            attempts: 0,
        }
    }

    pub(crate) fn start(&mut self, input: &WorkflowState) {
        self.status = NodeStatus::Running;
        self.input = Some(input.clone());
        self.attempts += 1;
    }

    pub(crate) fn complete(&mut self, output: StepOutput) {
        self.status = NodeStatus::Completed;
        self.output = Some(output);
        self.error = None;
    }

    pub(crate) fn fail(&mut self, status: NodeStatus, error: impl Into<String>) {
        self.status = status;
        self.error = Some(error.into());
    }
}
