use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use overseer_core::config::AppConfig;
use overseer_core::error::OverseerError;
use overseer_core::traits::Step;
use overseer_core::types::{NodeStatus, RecoveryStrategy, StepOutput, TerminationReason, WorkflowState};
use overseer_supervisor::{Executor, LogStatus, StepRegistry, SupervisorContext, WorkflowGraph};
use overseer_test_utils::{
    pipeline_steps, FailingStep, FlakyStep, ManualClock, OkStep, RecordingStep, SlowStep, PIPELINE,
};

/// The six-stage pipeline with its guarded edges, including the branches
/// that stay closed on the happy path.
fn pipeline_graph() -> WorkflowGraph {
    let mut g = WorkflowGraph::new();
    for n in PIPELINE {
        g.add_node(n);
    }
    g.add_edge("input_processing", "analysis", "input_valid")
        .add_edge("analysis", "decision", "analysis_complete")
        .add_edge("decision", "execution", "requires_execution")
        .add_edge("decision", "output", "ready_for_output")
        .add_edge("execution", "validation", "execution_complete")
        .add_edge("validation", "output", "validation_passed")
        .add_edge("validation", "analysis", "validation_failed")
        .set_start("input_processing");
    g
}

fn pipeline_registry(overrides: Vec<(&str, Arc<dyn Step>)>) -> StepRegistry {
    let mut reg = StepRegistry::new();
    for (name, step) in pipeline_steps() {
        reg.register(name, step);
    }
    for (name, step) in overrides {
        reg.register(name, step);
    }
    reg
}

fn executor(graph: WorkflowGraph, steps: StepRegistry, config: AppConfig) -> Executor {
    let ctx = SupervisorContext::with_clock(&config, ManualClock::fixed());
    Executor::new(graph, steps, config, ctx)
}

fn quick_recovery() -> AppConfig {
    let mut config = AppConfig::default();
    config.recovery.strategies = vec![RecoveryStrategy::ImmediateRetry];
    config
}

#[tokio::test]
async fn test_happy_path_pipeline_completes_every_stage() {
    let exec = executor(pipeline_graph(), pipeline_registry(vec![]), AppConfig::default());
    let result = exec.run_with_id("scenario-a", WorkflowState::new()).await.unwrap();

    assert_eq!(result.completed_nodes, PIPELINE.to_vec());
    assert_eq!(result.total_iterations, 6);
    assert_eq!(result.log.len(), 6);
    assert_eq!(result.reason, TerminationReason::Completed);
    for (entry, name) in result.log.iter().zip(PIPELINE) {
        assert_eq!(entry.node, name);
        assert_eq!(entry.status, LogStatus::Completed);
        assert!(!entry.recovery_applied);
    }
    assert_eq!(
        result.state.get("output_result"),
        Some(&json!({"final_output": {"status": "success"}}))
    );
    assert_eq!(result.state.get_bool("validation_passed"), Some(true));
}

#[tokio::test]
async fn test_failing_analysis_without_recovery_stops_the_pipeline() {
    let mut config = AppConfig::default();
    config.recovery.enabled = false;
    config.escalation.enabled = false;

    let analysis = FailingStep::new("analysis", "model unavailable");
    let reg = pipeline_registry(vec![("analysis", analysis.clone() as Arc<dyn Step>)]);
    let exec = executor(pipeline_graph(), reg, config);
    let result = exec.run(WorkflowState::new()).await.unwrap();

    assert_eq!(result.completed_nodes, vec!["input_processing"]);
    assert_eq!(result.total_iterations, 2);
    assert_eq!(result.log.len(), 2);
    assert_eq!(result.log[1].node, "analysis");
    assert_eq!(result.log[1].status, LogStatus::Failed);
    assert!(result.log[1].error.as_deref().unwrap().contains("model unavailable"));
    assert_eq!(analysis.calls(), 1);
    assert!(result.entries_for("decision").next().is_none());
    assert_eq!(result.node("analysis").unwrap().status, NodeStatus::Failed);
    assert!(result.recovery_stats.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_flaky_analysis_recovers_with_backoff() {
    let mut config = AppConfig::default();
    config.recovery.max_retries = 3;
    config.recovery.strategies = vec![RecoveryStrategy::ExponentialBackoff];

    let analysis = FlakyStep::new(
        "analysis",
        2,
        StepOutput::new(json!({"analysis_result": {"risk_level": "low"}}))
            .with_flag("analysis_complete", true)
            .with_flag("requires_execution", true),
    );
    let reg = pipeline_registry(vec![("analysis", analysis.clone() as Arc<dyn Step>)]);
    let exec = executor(pipeline_graph(), reg, config);

    let started = tokio::time::Instant::now();
    let result = exec.run(WorkflowState::new()).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(3000));
    assert_eq!(analysis.calls(), 3);
    assert_eq!(result.completed_nodes.len(), 6);

    let entry = result.entries_for("analysis").next().unwrap();
    assert_eq!(entry.status, LogStatus::Completed);
    assert!(entry.recovery_applied);

    // Six first tries plus two retries of analysis.
    let stats = result.recovery_stats.unwrap();
    assert_eq!(stats.total_attempts, 8);
    assert_eq!(stats.failed_attempts, 2);
    assert_eq!(stats.successful_attempts, 6);
}

#[tokio::test]
async fn test_recovery_fallback_result_keeps_the_pipeline_going() {
    let mut config = quick_recovery();
    config.recovery.max_retries = 1;
    config.recovery.strategies = vec![RecoveryStrategy::ImmediateRetry, RecoveryStrategy::FallbackDefault];
    config.escalation.enabled = false;

    let decision = FailingStep::new("decision", "no quorum");
    let mut reg = pipeline_registry(vec![("decision", decision.clone() as Arc<dyn Step>)]);
    reg.set_fallback_result("decision", json!({"decision": {"action": "hold"}}));

    let exec = executor(pipeline_graph(), reg, config);
    let result = exec.run(WorkflowState::new()).await.unwrap();

    assert_eq!(decision.calls(), 2);
    assert_eq!(result.state.get("decision_result"), Some(&json!({"decision": {"action": "hold"}})));
    let entry = result.entries_for("decision").next().unwrap();
    assert_eq!(entry.status, LogStatus::Completed);
    assert!(entry.recovery_applied);
    // The flags set by analysis still route through execution.
    assert_eq!(result.completed_nodes.len(), 6);
}

#[tokio::test]
async fn test_alternative_step_replaces_exhausted_primary() {
    let mut config = quick_recovery();
    config.recovery.max_retries = 0;
    config.recovery.strategies = vec![RecoveryStrategy::ImmediateRetry, RecoveryStrategy::AlternativeAgent];

    let execution = FailingStep::new("execution", "runner crashed");
    let backup = OkStep::new(
        StepOutput::new(json!({"execution_result": {"output_items": 3}}))
            .with_flag("execution_complete", true),
    );
    let mut reg = pipeline_registry(vec![("execution", execution.clone() as Arc<dyn Step>)]);
    reg.register_alternative("execution", backup.clone());

    let exec = executor(pipeline_graph(), reg, config);
    let result = exec.run(WorkflowState::new()).await.unwrap();

    assert_eq!(execution.calls(), 1);
    assert_eq!(backup.calls(), 1);
    assert_eq!(
        result.state.get("execution_result"),
        Some(&json!({"execution_result": {"output_items": 3}}))
    );
    assert!(result.succeeded());
}

#[tokio::test]
async fn test_node_reachable_twice_in_one_iteration_runs_once() {
    // a -> {b, c}, b -> c: c is ready in iteration 2 and again from b.
    let mut g = WorkflowGraph::new();
    for n in ["a", "b", "c"] {
        g.add_node(n);
    }
    g.add_edge("a", "b", "always")
        .add_edge("a", "c", "always")
        .add_edge("a", "c", "always")
        .add_edge("b", "c", "always")
        .set_start("a");

    let c = OkStep::returning(json!("c"));
    let mut reg = StepRegistry::new();
    reg.register("a", OkStep::returning(json!("a")));
    reg.register("b", OkStep::returning(json!("b")));
    reg.register("c", c.clone());

    for parallel in [false, true] {
        let mut config = quick_recovery();
        config.executor.parallel = parallel;
        let exec = executor(g.clone(), reg.clone(), config);
        let result = exec.run(WorkflowState::new()).await.unwrap();

        let completions = result
            .log
            .iter()
            .filter(|e| e.node == "c" && e.status == LogStatus::Completed)
            .count();
        assert_eq!(completions, 1);
        assert_eq!(result.total_iterations, 2);
    }
    assert_eq!(c.calls(), 2);
}

#[tokio::test]
async fn test_parallel_batch_sees_pre_iteration_state_and_merges_in_order() {
    let mut g = WorkflowGraph::new();
    for n in ["start", "left", "right", "join"] {
        g.add_node(n);
    }
    g.add_edge("start", "left", "always")
        .add_edge("start", "right", "always")
        .add_edge("left", "join", "always")
        .add_edge("right", "join", "always")
        .set_start("start");

    let left = RecordingStep::new(StepOutput::new(json!("L")).with_update("winner", json!("left")));
    let right = RecordingStep::new(StepOutput::new(json!("R")).with_update("winner", json!("right")));
    let join = RecordingStep::new(StepOutput::new(json!("J")));
    let mut reg = StepRegistry::new();
    reg.register("start", OkStep::returning(json!("S")));
    reg.register("left", left.clone());
    reg.register("right", right.clone());
    reg.register("join", join.clone());

    let exec = executor(g, reg, quick_recovery());
    let result = exec.run(WorkflowState::new()).await.unwrap();

    let right_saw = &right.seen()[0];
    assert!(right_saw.contains("start_result"));
    assert!(!right_saw.contains("left_result"));

    let join_saw = &join.seen()[0];
    assert_eq!(join_saw.get("left_result"), Some(&json!("L")));
    assert_eq!(join_saw.get("right_result"), Some(&json!("R")));
    // Outputs merge in ready order, so the later node wins a shared key.
    assert_eq!(result.state.get_str("winner"), Some("right"));
    assert_eq!(result.completed_nodes, vec!["start", "left", "right", "join"]);
}

#[tokio::test(start_paused = true)]
async fn test_ready_set_runs_concurrently_when_parallel() {
    let mut g = WorkflowGraph::new();
    for n in ["start", "slow_a", "slow_b"] {
        g.add_node(n);
    }
    g.add_edge("start", "slow_a", "always")
        .add_edge("start", "slow_b", "always")
        .set_start("start");

    let mut reg = StepRegistry::new();
    reg.register("start", OkStep::returning(json!(null)));
    reg.register("slow_a", SlowStep::new(Duration::from_secs(1), StepOutput::default()));
    reg.register("slow_b", SlowStep::new(Duration::from_secs(1), StepOutput::default()));

    let started = tokio::time::Instant::now();
    let exec = executor(g.clone(), reg.clone(), quick_recovery());
    exec.run(WorkflowState::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let mut sequential = quick_recovery();
    sequential.executor.parallel = false;
    let started = tokio::time::Instant::now();
    let exec = executor(g, reg, sequential);
    exec.run(WorkflowState::new()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_unknown_guard_policy() {
    let mut g = WorkflowGraph::new();
    g.add_node("a").add_node("b");
    g.add_edge("a", "b", "deploy_approved").set_start("a");
    let mut reg = StepRegistry::new();
    reg.register("a", OkStep::returning(json!("a")));
    reg.register("b", OkStep::returning(json!("b")));

    let exec = executor(g.clone(), reg.clone(), AppConfig::default());
    let err = exec.run(WorkflowState::new()).await.unwrap_err();
    assert!(matches!(err, OverseerError::UnknownGuard { ref guard, .. } if guard == "deploy_approved"));

    let mut lenient = AppConfig::default();
    lenient.executor.strict_guards = false;
    let exec = executor(g, reg, lenient);
    let result = exec.run(WorkflowState::new()).await.unwrap();
    assert_eq!(result.completed_nodes, vec!["a"]);
}

#[tokio::test]
async fn test_initial_state_reaches_the_first_step() {
    let first = RecordingStep::new(StepOutput::default());
    let mut g = WorkflowGraph::new();
    g.add_node("only").set_start("only");
    let mut reg = StepRegistry::new();
    reg.register("only", first.clone());

    let exec = executor(g, reg, AppConfig::default());
    let initial = WorkflowState::from_json(json!({"task": "summarise"}));
    let result = exec.run(initial).await.unwrap();

    assert_eq!(first.seen()[0].get_str("task"), Some("summarise"));
    assert_eq!(result.state.get_str("task"), Some("summarise"));
    assert_eq!(result.node("only").unwrap().input.as_ref().unwrap().get_str("task"), Some("summarise"));
}
