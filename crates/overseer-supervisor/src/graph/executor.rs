use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use overseer_core::config::AppConfig;
use overseer_core::error::{OverseerError, Result};
use overseer_core::traits::Step;
use overseer_core::types::{
    NodeStatus, StepOutput, TerminationReason, WorkflowEvent, WorkflowState,
};

use super::node::NodeRecord;
use super::workflow::WorkflowGraph;
use crate::context::SupervisorContext;
use crate::escalation::{BlockedTask, EscalationHandler, EscalationOutcome, EscalationRecord};
use crate::recovery::{RecoveryEngine, RecoveryStats};
use crate::step::StepRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Completed,
    Failed,
    Escalated,
}

/// One line of the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub iteration: usize,
    pub node: String,
    pub status: LogStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recovery_applied: bool,
}

/// Everything a run produced. Step failures are reported here, never as
/// errors from [`Executor::run`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub state: WorkflowState,
    pub log: Vec<LogEntry>,
    /// Completed node names in completion order.
    pub completed_nodes: Vec<String>,
    pub total_iterations: usize,
    pub reason: TerminationReason,
    /// Per-node records in graph order.
    pub nodes: Vec<NodeRecord>,
    pub escalations: Vec<EscalationRecord>,
    pub blocked_tasks: Vec<BlockedTask>,
    /// Present when recovery was enabled for the run.
    pub recovery_stats: Option<RecoveryStats>,
}

impl WorkflowResult {
    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Log entries for one node, in order.
    pub fn entries_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.log.iter().filter(move |e| e.node == node)
    }

    /// The run drained its ready set and no node failed or escalated.
    pub fn succeeded(&self) -> bool {
        self.reason == TerminationReason::Completed
            && self.log.iter().all(|e| e.status == LogStatus::Completed)
    }
}

/// How one node's dispatch ended.
enum Dispatch {
    Completed {
        output: StepOutput,
        recovery_applied: bool,
    },
    Failed(String),
    Escalated(EscalationRecord),
}

/// What the batch loop does after settling a node.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Skip the remaining nodes of this iteration.
    StopBatch,
    /// Stop the run.
    Halt,
}

/// Collaborators created for one run.
struct RunScope {
    workflow_id: String,
    recovery: Option<RecoveryEngine>,
    escalation: Option<EscalationHandler>,
}

/// Mutable bookkeeping of one run.
struct RunState {
    state: WorkflowState,
    completed: Vec<String>,
    completed_set: HashSet<String>,
    log: Vec<LogEntry>,
    records: Vec<NodeRecord>,
    escalations: Vec<EscalationRecord>,
    next: Vec<String>,
}

impl RunState {
    fn record(&mut self, node: &str) -> Option<&mut NodeRecord> {
        self.records.iter_mut().find(|r| r.name == node)
    }
}

/// Drives a [`WorkflowGraph`] to completion.
///
/// Each iteration runs the current ready set, through the recovery engine
/// and the escalation handler when they are enabled, folds every output into
/// the shared state and collects the targets of satisfied edges as the next
/// ready set. A node runs at most once per run.
pub struct Executor {
    graph: WorkflowGraph,
    steps: StepRegistry,
    config: AppConfig,
    ctx: SupervisorContext,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        graph: WorkflowGraph,
        steps: StepRegistry,
        config: AppConfig,
        ctx: SupervisorContext,
    ) -> Self {
        Self {
            graph,
            steps,
            config,
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run at the next iteration boundary. Node
    /// executions already in flight finish normally.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn context(&self) -> &SupervisorContext {
        &self.ctx
    }

    /// Run with a fresh workflow id.
    pub async fn run(&self, initial: WorkflowState) -> Result<WorkflowResult> {
        self.run_with_id(uuid::Uuid::new_v4().to_string(), initial)
            .await
    }

    /// Run the workflow. Only configuration errors are returned as `Err`.
    pub async fn run_with_id(
        &self,
        workflow_id: impl Into<String>,
        initial: WorkflowState,
    ) -> Result<WorkflowResult> {
        let workflow_id = workflow_id.into();
        let start = self.validate()?;
        let max_iterations = self.config.executor.max_iterations;
        self.register_breakers();

        let scope = RunScope {
            workflow_id: workflow_id.clone(),
            recovery: self.config.recovery.enabled.then(|| {
                RecoveryEngine::new(
                    self.config.recovery.clone(),
                    self.ctx.breakers.clone(),
                    self.ctx.clock.clone(),
                )
                .with_event_bus(self.ctx.event_bus.clone())
            }),
            escalation: self
                .config
                .escalation
                .enabled
                .then(|| EscalationHandler::new(&self.config.escalation, self.ctx.clock.clone())),
        };

        let mut run = RunState {
            state: initial,
            completed: Vec::new(),
            completed_set: HashSet::new(),
            log: Vec::new(),
            records: self.graph.nodes().iter().map(NodeRecord::new).collect(),
            escalations: Vec::new(),
            next: Vec::new(),
        };

        info!(workflow_id = %workflow_id, start = %start, max_iterations, "Workflow started");
        self.ctx.event_bus.publish(WorkflowEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
            start_node: start.clone(),
        });
        if let Some(monitor) = &self.ctx.monitor {
            monitor.watch_workflow(&workflow_id);
        }

        let every_iteration = self
            .config
            .checkpoint
            .as_ref()
            .map_or(true, |c| c.every_iteration);

        let mut ready = vec![start];
        let mut iteration = 0usize;
        let reason = loop {
            if ready.is_empty() {
                break TerminationReason::Completed;
            }
            if iteration >= max_iterations {
                warn!(workflow_id = %workflow_id, max_iterations, pending = ?ready, "Iteration limit reached");
                break TerminationReason::IterationLimit;
            }
            if self.cancel.is_cancelled() {
                info!(workflow_id = %workflow_id, iteration, "Workflow cancelled");
                break TerminationReason::Cancelled;
            }
            iteration += 1;

            let batch: Vec<String> = ready
                .drain(..)
                .filter(|n| !run.completed_set.contains(n))
                .collect();
            debug!(workflow_id = %workflow_id, iteration, ready = ?batch, "Iteration started");

            let halted = self.run_batch(&scope, &mut run, iteration, &batch).await;

            if let Some(monitor) = &self.ctx.monitor {
                monitor.record_workflow_progress(&workflow_id, &run.completed, iteration);
            }
            if every_iteration {
                self.checkpoint(&workflow_id, &run, iteration);
            }
            if halted {
                warn!(workflow_id = %workflow_id, iteration, "Halting after level-3 escalation");
                break TerminationReason::Escalated;
            }

            let mut seen = HashSet::new();
            ready = run
                .next
                .drain(..)
                .filter(|n| !run.completed_set.contains(n) && seen.insert(n.clone()))
                .collect();
        };

        if !every_iteration {
            self.checkpoint(&workflow_id, &run, iteration);
        }
        if let Some(monitor) = &self.ctx.monitor {
            monitor.unwatch_workflow(&workflow_id);
        }

        info!(
            workflow_id = %workflow_id,
            iterations = iteration,
            completed = run.completed.len(),
            reason = ?reason,
            "Workflow finished"
        );
        self.ctx.event_bus.publish(WorkflowEvent::WorkflowCompleted {
            workflow_id: workflow_id.clone(),
            completed_nodes: run.completed.clone(),
            total_iterations: iteration,
            reason,
        });

        Ok(WorkflowResult {
            workflow_id,
            state: run.state,
            log: run.log,
            completed_nodes: run.completed,
            total_iterations: iteration,
            reason,
            nodes: run.records,
            escalations: run.escalations,
            blocked_tasks: scope
                .escalation
                .as_ref()
                .map(|h| h.blocked_tasks())
                .unwrap_or_default(),
            recovery_stats: scope.recovery.as_ref().map(|r| r.stats()),
        })
    }

    /// Graph structure plus a registered step for every node.
    fn validate(&self) -> Result<String> {
        self.graph.validate(self.config.executor.strict_guards)?;
        if let Some(missing) = self.graph.nodes().iter().find(|n| !self.steps.contains(n)) {
            return Err(OverseerError::UnknownStep(missing.clone()));
        }
        self.graph
            .start()
            .map(str::to_string)
            .ok_or(OverseerError::MissingStartNode)
    }

    /// Give every node and every registered alternative a breaker. Custom
    /// timeouts set on the shared breakers beforehand are kept.
    fn register_breakers(&self) {
        let breakers = &self.ctx.breakers;
        for node in self.graph.nodes() {
            breakers.register_default(node);
        }
        for name in self.steps.alternatives().keys() {
            breakers.register_default(name);
        }
    }

    /// Run one ready set. Returns whether the run must halt.
    async fn run_batch(
        &self,
        scope: &RunScope,
        run: &mut RunState,
        iteration: usize,
        batch: &[String],
    ) -> bool {
        let can_intercept = scope.recovery.is_some() || scope.escalation.is_some();
        let mut halted = false;

        if self.config.executor.parallel && can_intercept && batch.len() > 1 {
            // Every node of the batch sees the state as it was before the
            // iteration; outputs merge afterwards in ready order.
            let snapshot = run.state.clone();
            for node in batch {
                self.mark_started(scope, run, iteration, node, &snapshot);
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|node| self.dispatch(scope, node, snapshot.clone())),
            )
            .await;
            for (node, dispatch) in batch.iter().zip(results) {
                if self.settle(scope, run, iteration, node, dispatch) == Flow::Halt {
                    halted = true;
                }
            }
            return halted;
        }

        for node in batch {
            let input = run.state.clone();
            self.mark_started(scope, run, iteration, node, &input);
            let dispatch = self.dispatch(scope, node, input).await;
            match self.settle(scope, run, iteration, node, dispatch) {
                Flow::Continue => {}
                Flow::StopBatch => break,
                Flow::Halt => {
                    halted = true;
                    break;
                }
            }
        }
        halted
    }

    fn mark_started(
        &self,
        scope: &RunScope,
        run: &mut RunState,
        iteration: usize,
        node: &str,
        input: &WorkflowState,
    ) {
        if let Some(record) = run.record(node) {
            record.start(input);
        }
        debug!(workflow_id = %scope.workflow_id, node, iteration, "Node started");
        self.ctx.event_bus.publish(WorkflowEvent::NodeStarted {
            workflow_id: scope.workflow_id.clone(),
            node: node.to_string(),
            iteration,
        });
    }

    /// Execute a node's step. Never fails: every error becomes a
    /// [`Dispatch`] variant.
    async fn dispatch(&self, scope: &RunScope, node: &str, input: WorkflowState) -> Dispatch {
        let Some(step) = self.steps.get(node) else {
            return Dispatch::Failed(OverseerError::UnknownStep(node.to_string()).to_string());
        };

        if let Some(monitor) = &self.ctx.monitor {
            monitor.watch_run_step(&scope.workflow_id, node);
        }

        let outcome = self.execute_step(scope, node, step.clone(), &input).await;
        let dispatch = match outcome {
            Ok((output, recovery_applied)) => Dispatch::Completed {
                output,
                recovery_applied,
            },
            Err(error) => match &scope.escalation {
                Some(handler) => {
                    let task_id = format!("{}:{}", scope.workflow_id, node);
                    match handler
                        .escalate(&task_id, node, step, &input, &error, &self.steps)
                        .await
                    {
                        EscalationOutcome::Resolved { output, level, alternative_used } => {
                            info!(node, level = level.as_u8(), alternative = ?alternative_used, "Escalation resolved node");
                            Dispatch::Completed {
                                output,
                                recovery_applied: true,
                            }
                        }
                        EscalationOutcome::Escalated(record) => Dispatch::Escalated(record),
                    }
                }
                None => Dispatch::Failed(error),
            },
        };

        if let Some(monitor) = &self.ctx.monitor {
            monitor.unwatch_run_step(&scope.workflow_id, node);
        }
        dispatch
    }

    /// Run the step through the recovery engine when enabled, directly
    /// otherwise. `Ok` carries the output and whether recovery was needed.
    async fn execute_step(
        &self,
        scope: &RunScope,
        node: &str,
        step: Arc<dyn Step>,
        input: &WorkflowState,
    ) -> std::result::Result<(StepOutput, bool), String> {
        match &scope.recovery {
            Some(engine) => {
                let outcome = engine
                    .execute(
                        node,
                        step,
                        input,
                        self.steps.alternatives(),
                        self.steps.fallback_result(node),
                    )
                    .await;
                // Success and fallback both carry an output to merge.
                match outcome.output {
                    Some(output) => Ok((output, outcome.recovery_applied)),
                    None => Err(outcome
                        .error
                        .unwrap_or_else(|| format!("step {} failed", node))),
                }
            }
            None => step
                .execute(input.clone())
                .await
                .map(|output| (output, false))
                .map_err(|e| e.to_string()),
        }
    }

    /// Fold a dispatch result into the run.
    fn settle(
        &self,
        scope: &RunScope,
        run: &mut RunState,
        iteration: usize,
        node: &str,
        dispatch: Dispatch,
    ) -> Flow {
        let workflow_id = scope.workflow_id.clone();
        match dispatch {
            Dispatch::Completed {
                output,
                recovery_applied,
            } => {
                run.state.apply_output(node, &output);
                run.log.push(LogEntry {
                    iteration,
                    node: node.to_string(),
                    status: LogStatus::Completed,
                    result: Some(output.result.clone()),
                    error: None,
                    recovery_applied,
                });
                if let Some(record) = run.record(node) {
                    record.complete(output);
                }
                run.completed.push(node.to_string());
                run.completed_set.insert(node.to_string());

                let next: Vec<String> = self
                    .graph
                    .next_nodes(node, &run.state)
                    .into_iter()
                    .filter(|n| !run.completed_set.contains(n))
                    .collect();
                run.next.extend(next);

                info!(workflow_id = %workflow_id, node, iteration, recovery_applied, "Node completed");
                self.ctx.event_bus.publish(WorkflowEvent::NodeCompleted {
                    workflow_id,
                    node: node.to_string(),
                    iteration,
                    recovery_applied,
                });
                Flow::Continue
            }
            Dispatch::Failed(error) => {
                error!(workflow_id = %workflow_id, node, iteration, error = %error, "Node failed");
                run.log.push(LogEntry {
                    iteration,
                    node: node.to_string(),
                    status: LogStatus::Failed,
                    result: None,
                    error: Some(error.clone()),
                    recovery_applied: scope.recovery.is_some(),
                });
                if let Some(record) = run.record(node) {
                    record.fail(NodeStatus::Failed, error.clone());
                }
                self.ctx.event_bus.publish(WorkflowEvent::NodeFailed {
                    workflow_id,
                    node: node.to_string(),
                    iteration,
                    error,
                });
                if scope.recovery.is_none() {
                    Flow::StopBatch
                } else {
                    Flow::Continue
                }
            }
            Dispatch::Escalated(record) => {
                error!(workflow_id = %workflow_id, node, iteration, task_id = %record.task_id, "Node escalated for manual intervention");
                run.log.push(LogEntry {
                    iteration,
                    node: node.to_string(),
                    status: LogStatus::Escalated,
                    result: None,
                    error: Some(record.error.clone()),
                    recovery_applied: true,
                });
                if let Some(node_record) = run.record(node) {
                    node_record.fail(NodeStatus::Blocked, record.error.clone());
                }
                self.ctx.event_bus.publish(WorkflowEvent::NodeEscalated {
                    workflow_id,
                    node: node.to_string(),
                    task_id: record.task_id.clone(),
                    error: record.error.clone(),
                });
                run.escalations.push(record);
                if self.config.executor.halt_on_escalation {
                    Flow::Halt
                } else {
                    Flow::Continue
                }
            }
        }
    }

    /// Persist the state when a checkpoint sink is attached. Failures are
    /// logged; they never affect the run.
    fn checkpoint(&self, workflow_id: &str, run: &RunState, iteration: usize) {
        let Some(sink) = &self.ctx.checkpoints else {
            return;
        };
        let metadata = serde_json::json!({
            "iteration": iteration,
            "completed_nodes": run.completed,
        });
        match sink.save(workflow_id, &run.state.to_json(), Some(&metadata)) {
            Ok(checkpoint_id) => {
                debug!(workflow_id, checkpoint_id = %checkpoint_id, iteration, "Checkpoint saved");
                self.ctx.event_bus.publish(WorkflowEvent::CheckpointSaved {
                    workflow_id: workflow_id.to_string(),
                    checkpoint_id,
                    iteration,
                });
            }
            Err(e) => warn!(workflow_id, iteration, error = %e, "Failed to save checkpoint"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::types::result_key;
    use overseer_test_utils::{pipeline_steps, FailingStep, ManualClock, OkStep, PIPELINE};
    use serde_json::json;

    fn config(recovery: bool, escalation: bool) -> AppConfig {
        let mut config = AppConfig::default();
        config.recovery.enabled = recovery;
        config.recovery.strategies = vec![overseer_core::RecoveryStrategy::ImmediateRetry];
        config.escalation.enabled = escalation;
        config
    }

    fn ctx(config: &AppConfig) -> SupervisorContext {
        SupervisorContext::with_clock(config, ManualClock::fixed())
    }

    fn linear(nodes: &[&str]) -> WorkflowGraph {
        let mut g = WorkflowGraph::new();
        for n in nodes {
            g.add_node(*n);
        }
        for pair in nodes.windows(2) {
            g.add_edge(pair[0], pair[1], "always");
        }
        g.set_start(nodes[0]);
        g
    }

    fn ok_steps(nodes: &[&str]) -> StepRegistry {
        let mut reg = StepRegistry::new();
        for n in nodes {
            reg.register(*n, OkStep::returning(json!(n)));
        }
        reg
    }

    #[tokio::test]
    async fn test_missing_start_is_config_error() {
        let mut g = WorkflowGraph::new();
        g.add_node("a");
        let config = config(false, false);
        let exec = Executor::new(g, ok_steps(&["a"]), config.clone(), ctx(&config));
        let err = exec.run(WorkflowState::new()).await.unwrap_err();
        assert!(matches!(err, OverseerError::MissingStartNode));
    }

    #[tokio::test]
    async fn test_node_without_step_is_config_error() {
        let config = config(false, false);
        let exec = Executor::new(linear(&["a", "b"]), ok_steps(&["a"]), config.clone(), ctx(&config));
        let err = exec.run(WorkflowState::new()).await.unwrap_err();
        assert!(matches!(err, OverseerError::UnknownStep(ref n) if n == "b"));
    }

    #[tokio::test]
    async fn test_linear_pipeline_runs_one_node_per_iteration() {
        let config = config(true, true);
        let mut reg = StepRegistry::new();
        for (name, step) in pipeline_steps() {
            reg.register(name, step);
        }
        let exec = Executor::new(linear(&PIPELINE), reg, config.clone(), ctx(&config));
        let result = exec.run_with_id("wf-a", WorkflowState::new()).await.unwrap();

        assert_eq!(result.completed_nodes, PIPELINE.to_vec());
        assert_eq!(result.total_iterations, 6);
        assert_eq!(result.log.len(), 6);
        assert_eq!(result.reason, TerminationReason::Completed);
        assert!(result.succeeded());
        assert!(result.state.contains(&result_key("output")));
        assert!(result.recovery_stats.is_some());
        assert!(result.nodes.iter().all(|n| n.status == NodeStatus::Completed));
    }

    #[tokio::test]
    async fn test_diamond_join_runs_once() {
        let mut g = WorkflowGraph::new();
        for n in ["start", "left", "right", "join"] {
            g.add_node(n);
        }
        g.add_edge("start", "left", "always")
            .add_edge("start", "left", "always")
            .add_edge("start", "right", "always")
            .add_edge("left", "join", "always")
            .add_edge("right", "join", "always")
            .set_start("start");

        let config = config(false, false);
        let join = OkStep::returning(json!("joined"));
        let mut reg = ok_steps(&["start", "left", "right"]);
        reg.register("join", join.clone());

        let exec = Executor::new(g, reg, config.clone(), ctx(&config));
        let result = exec.run(WorkflowState::new()).await.unwrap();

        assert_eq!(join.calls(), 1);
        assert_eq!(result.total_iterations, 3);
        assert_eq!(result.entries_for("left").count(), 1);
        assert_eq!(result.entries_for("join").count(), 1);
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let nodes = ["a", "b", "c", "d"];
        let mut config = config(false, false);
        config.executor.max_iterations = 2;
        let exec = Executor::new(linear(&nodes), ok_steps(&nodes), config.clone(), ctx(&config));
        let result = exec.run(WorkflowState::new()).await.unwrap();

        assert_eq!(result.reason, TerminationReason::IterationLimit);
        assert_eq!(result.total_iterations, 2);
        assert_eq!(result.completed_nodes, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failure_without_recovery_stops_downstream() {
        let nodes = ["a", "b", "c"];
        let config = config(false, false);
        let mut reg = ok_steps(&nodes);
        reg.register("b", FailingStep::new("b", "boom"));
        let exec = Executor::new(linear(&nodes), reg, config.clone(), ctx(&config));
        let result = exec.run(WorkflowState::new()).await.unwrap();

        assert_eq!(result.completed_nodes, vec!["a"]);
        assert_eq!(result.total_iterations, 2);
        assert_eq!(result.node("b").unwrap().status, NodeStatus::Failed);
        assert_eq!(result.node("c").unwrap().status, NodeStatus::Pending);
        let failed = result.entries_for("b").next().unwrap();
        assert_eq!(failed.status, LogStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("boom"));
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let nodes = ["a", "b"];
        let config = config(false, false);
        let exec = Executor::new(linear(&nodes), ok_steps(&nodes), config.clone(), ctx(&config));
        exec.cancel_token().cancel();
        let result = exec.run(WorkflowState::new()).await.unwrap();

        assert_eq!(result.reason, TerminationReason::Cancelled);
        assert_eq!(result.total_iterations, 0);
        assert!(result.completed_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let nodes = ["a", "b"];
        let config = config(false, false);
        let ctx = ctx(&config);
        let mut rx = ctx.event_bus.subscribe();
        let exec = Executor::new(linear(&nodes), ok_steps(&nodes), config.clone(), ctx);
        exec.run_with_id("wf-ev", WorkflowState::new()).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(
            kinds,
            vec![
                "workflow_started",
                "node_started",
                "node_completed",
                "node_started",
                "node_completed",
                "workflow_completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_run_registers_breakers_for_its_nodes() {
        let config = config(true, false);
        let ctx = ctx(&config);
        let breakers = ctx.breakers.clone();
        let bad = FailingStep::new("b", "refused");
        let mut reg = ok_steps(&["a"]);
        reg.register("b", bad.clone());
        let exec = Executor::new(linear(&["a", "b"]), reg, config, ctx);

        let first = exec.run(WorkflowState::new()).await.unwrap();
        assert_eq!(first.completed_nodes, vec!["a"]);
        assert_eq!(bad.calls(), 4);
        let names: Vec<String> = breakers.snapshot().into_iter().map(|b| b.step).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(breakers.is_open("b"));

        // The open circuit keeps the second run from calling the step.
        let second = exec.run(WorkflowState::new()).await.unwrap();
        assert_eq!(bad.calls(), 4);
        let entry = second.entries_for("b").next().unwrap();
        assert!(entry.error.as_deref().unwrap().contains("circuit open"));
    }
}
