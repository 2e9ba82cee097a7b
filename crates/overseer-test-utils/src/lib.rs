//! Shared test utilities for Overseer crates: a manual clock, scripted steps,
//! an in-memory checkpoint sink and the six-stage pipeline fixture.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::BoxFuture;
use serde_json::json;

use overseer_core::error::{OverseerError, Result};
use overseer_core::traits::{Checkpoint, CheckpointSink, Step};
use overseer_core::types::{StepOutput, WorkflowState};
use overseer_core::Clock;

// ──────────────────────────────────────────────
// Clock
// ──────────────────────────────────────────────

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    /// A clock starting at a fixed, arbitrary instant.
    pub fn fixed() -> Arc<Self> {
        Self::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ──────────────────────────────────────────────
// Steps
// ──────────────────────────────────────────────

/// A step that always succeeds with a fixed output.
pub struct OkStep {
    output: StepOutput,
    calls: AtomicUsize,
}

impl OkStep {
    pub fn new(output: StepOutput) -> Arc<Self> {
        Arc::new(Self {
            output,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn returning(result: serde_json::Value) -> Arc<Self> {
        Self::new(StepOutput::new(result))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Step for OkStep {
    fn execute(&self, _state: WorkflowState) -> BoxFuture<'_, Result<StepOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let out = self.output.clone();
        Box::pin(async move { Ok(out) })
    }
}

/// A step that always fails.
pub struct FailingStep {
    name: String,
    message: String,
    calls: AtomicUsize,
}

impl FailingStep {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            message: message.into(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Step for FailingStep {
    fn execute(&self, _state: WorkflowState) -> BoxFuture<'_, Result<StepOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let err = OverseerError::step(self.name.clone(), self.message.clone());
        Box::pin(async move { Err(err) })
    }
}

/// A step that fails a fixed number of times, then succeeds.
pub struct FlakyStep {
    name: String,
    failures: usize,
    output: StepOutput,
    calls: AtomicUsize,
}

impl FlakyStep {
    pub fn new(name: impl Into<String>, failures: usize, output: StepOutput) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            failures,
            output,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Step for FlakyStep {
    fn execute(&self, _state: WorkflowState) -> BoxFuture<'_, Result<StepOutput>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let result = if call <= self.failures {
            Err(OverseerError::step(
                self.name.clone(),
                format!("transient failure on call {}", call),
            ))
        } else {
            Ok(self.output.clone())
        };
        Box::pin(async move { result })
    }
}

/// A step that sleeps before succeeding, for liveness and concurrency tests.
pub struct SlowStep {
    delay: std::time::Duration,
    output: StepOutput,
}

impl SlowStep {
    pub fn new(delay: std::time::Duration, output: StepOutput) -> Arc<Self> {
        Arc::new(Self { delay, output })
    }
}

impl Step for SlowStep {
    fn execute(&self, _state: WorkflowState) -> BoxFuture<'_, Result<StepOutput>> {
        let delay = self.delay;
        let out = self.output.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(out)
        })
    }
}

/// A step that records the state snapshots it was handed.
pub struct RecordingStep {
    seen: Mutex<Vec<WorkflowState>>,
    output: StepOutput,
}

impl RecordingStep {
    pub fn new(output: StepOutput) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            output,
        })
    }

    pub fn seen(&self) -> Vec<WorkflowState> {
        self.seen.lock().unwrap().clone()
    }
}

impl Step for RecordingStep {
    fn execute(&self, state: WorkflowState) -> BoxFuture<'_, Result<StepOutput>> {
        self.seen.lock().unwrap().push(state);
        let out = self.output.clone();
        Box::pin(async move { Ok(out) })
    }
}

// ──────────────────────────────────────────────
// Pipeline fixture
// ──────────────────────────────────────────────

/// Node names of the six-stage sample pipeline, in order.
pub const PIPELINE: [&str; 6] = [
    "input_processing",
    "analysis",
    "decision",
    "execution",
    "validation",
    "output",
];

/// Steps for the sample pipeline. Each one sets the flags the next guard
/// reads, so the pipeline also runs end to end with the built-in guards.
pub fn pipeline_steps() -> Vec<(&'static str, Arc<dyn Step>)> {
    vec![
        (
            "input_processing",
            OkStep::new(
                StepOutput::new(json!({"processed_input": {"validated": true}}))
                    .with_flag("input_valid", true),
            ) as Arc<dyn Step>,
        ),
        (
            "analysis",
            OkStep::new(
                StepOutput::new(json!({"analysis_result": {"risk_level": "low"}}))
                    .with_flag("analysis_complete", true)
                    .with_flag("requires_execution", true),
            ),
        ),
        (
            "decision",
            OkStep::returning(json!({"decision": {"action": "execute"}})),
        ),
        (
            "execution",
            OkStep::new(
                StepOutput::new(json!({"execution_result": {"output_items": 10}}))
                    .with_flag("execution_complete", true),
            ),
        ),
        (
            "validation",
            OkStep::new(
                StepOutput::new(json!({"validation_result": {"is_valid": true}}))
                    .with_flag("validation_passed", true),
            ),
        ),
        (
            "output",
            OkStep::returning(json!({"final_output": {"status": "success"}})),
        ),
    ]
}

// ──────────────────────────────────────────────
// Checkpoints
// ──────────────────────────────────────────────

/// Checkpoint sink that keeps everything in memory.
#[derive(Default)]
pub struct MemoryCheckpointSink {
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl MemoryCheckpointSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.checkpoints.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointSink for MemoryCheckpointSink {
    fn save(
        &self,
        session_id: &str,
        data: &serde_json::Value,
        metadata: Option<&serde_json::Value>,
    ) -> Result<String> {
        let mut cps = self.checkpoints.lock().unwrap();
        let checkpoint_id = format!("mem-{}", cps.len() + 1);
        cps.push(Checkpoint {
            checkpoint_id: checkpoint_id.clone(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            data: data.clone(),
            metadata: metadata.cloned(),
        });
        Ok(checkpoint_id)
    }

    fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let cps = self.checkpoints.lock().unwrap();
        Ok(cps.iter().rev().find(|c| c.session_id == session_id).cloned())
    }

    fn load_all(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        let cps = self.checkpoints.lock().unwrap();
        Ok(cps
            .iter()
            .rev()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect())
    }
}
