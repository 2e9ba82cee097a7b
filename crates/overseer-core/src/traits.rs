use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{StepOutput, StuckIssue, WorkflowState};

/// Step: a named unit of work bound to a graph node.
///
/// A step receives an owned snapshot of the workflow state and either returns
/// its output or an error. Errors are expected failures: the executor feeds
/// them to recovery and escalation, it never propagates them.
pub trait Step: Send + Sync + 'static {
    fn execute(&self, state: WorkflowState) -> BoxFuture<'_, Result<StepOutput>>;
}

/// Adapter turning an async closure into a [`Step`].
pub struct FnStep<F>(F);

impl<F, Fut> Step for FnStep<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutput>> + Send + 'static,
{
    fn execute(&self, state: WorkflowState) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin((self.0)(state))
    }
}

/// Adapter turning a synchronous closure into a [`Step`].
pub struct SyncStep<F>(F);

impl<F> Step for SyncStep<F>
where
    F: Fn(WorkflowState) -> Result<StepOutput> + Send + Sync + 'static,
{
    fn execute(&self, state: WorkflowState) -> BoxFuture<'_, Result<StepOutput>> {
        let out = (self.0)(state);
        Box::pin(async move { out })
    }
}

/// Wrap an async closure as a shareable step.
pub fn step_fn<F, Fut>(f: F) -> Arc<dyn Step>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutput>> + Send + 'static,
{
    Arc::new(FnStep(f))
}

/// Wrap a synchronous closure as a shareable step.
pub fn sync_step<F>(f: F) -> Arc<dyn Step>
where
    F: Fn(WorkflowState) -> Result<StepOutput> + Send + Sync + 'static,
{
    Arc::new(SyncStep(f))
}

/// A persisted snapshot of workflow data for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Checkpoint collaborator. Persists named snapshots per session.
pub trait CheckpointSink: Send + Sync + 'static {
    /// Persist a checkpoint and return its id.
    fn save(
        &self,
        session_id: &str,
        data: &serde_json::Value,
        metadata: Option<&serde_json::Value>,
    ) -> Result<String>;

    /// Most recent checkpoint for a session.
    fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints for a session, newest first.
    fn load_all(&self, session_id: &str) -> Result<Vec<Checkpoint>>;
}

/// Handler invoked by the liveness monitor for each newly detected issue.
///
/// Returns whether the handler considers the issue dealt with.
pub trait IssueHandler: Send + Sync + 'static {
    fn handle(&self, issue: StuckIssue) -> BoxFuture<'_, Result<bool>>;
}

/// Adapter turning a synchronous closure into an [`IssueHandler`].
pub struct FnIssueHandler<F>(pub F);

impl<F> IssueHandler for FnIssueHandler<F>
where
    F: Fn(&StuckIssue) -> Result<bool> + Send + Sync + 'static,
{
    fn handle(&self, issue: StuckIssue) -> BoxFuture<'_, Result<bool>> {
        let out = (self.0)(&issue);
        Box::pin(async move { out })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OverseerError;
    use serde_json::json;

    #[tokio::test]
    async fn test_step_fn_runs_async_closure() {
        let step = step_fn(|state: WorkflowState| async move {
            let task = state.get_str("task").unwrap_or("none").to_string();
            Ok(StepOutput::new(json!({ "echo": task })))
        });

        let mut state = WorkflowState::new();
        state.set("task", json!("build"));
        let out = step.execute(state).await.unwrap();
        assert_eq!(out.result, json!({"echo": "build"}));
    }

    #[tokio::test]
    async fn test_sync_step_propagates_error() {
        let step = sync_step(|_| Err(OverseerError::step("validate", "bad input")));
        let err = step.execute(WorkflowState::new()).await.unwrap_err();
        assert!(err.to_string().contains("bad input"));
    }
}
