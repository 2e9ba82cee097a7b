use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use overseer_core::error::{OverseerError, Result};
use overseer_core::traits::Step;
use overseer_core::types::{StepOutput, WorkflowState};

use crate::recovery::alternative_name;

/// Steps available to a workflow, by name.
///
/// Primary steps keep registration order; escalation picks its level-2
/// substitute from that order. Alternatives live in a separate table keyed
/// `<step>_fallback` and are only reached through the recovery engine.
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: Vec<(String, Arc<dyn Step>)>,
    alternatives: HashMap<String, Arc<dyn Step>>,
    fallbacks: HashMap<String, serde_json::Value>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("alternatives", &self.alternatives.keys().collect::<Vec<_>>())
            .field("fallbacks", &self.fallbacks)
            .finish()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Re-registering a name replaces the step in place.
    pub fn register_step(&mut self, name: impl Into<String>, step: Arc<dyn Step>, is_alternative: bool) {
        let name = name.into();
        if is_alternative {
            self.alternatives.insert(name, step);
            return;
        }
        match self.steps.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = step,
            None => self.steps.push((name, step)),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, step: Arc<dyn Step>) {
        self.register_step(name, step, false);
    }

    /// Register `step` as the `<for_step>_fallback` alternative.
    pub fn register_alternative(&mut self, for_step: &str, step: Arc<dyn Step>) {
        self.register_step(alternative_name(for_step), step, true);
    }

    /// Fixed result used when recovery falls back for `step`.
    pub fn set_fallback_result(&mut self, step: impl Into<String>, result: serde_json::Value) {
        self.fallbacks.insert(step.into(), result);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.iter().any(|(n, _)| n == name)
    }

    pub fn alternatives(&self) -> &HashMap<String, Arc<dyn Step>> {
        &self.alternatives
    }

    pub fn fallback_result(&self, step: &str) -> Option<&serde_json::Value> {
        self.fallbacks.get(step)
    }

    /// Primary step names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// First registered primary step not named `name`.
    pub fn first_other(&self, name: &str) -> Option<(String, Arc<dyn Step>)> {
        self.steps
            .iter()
            .find(|(n, _)| n != name)
            .map(|(n, s)| (n.clone(), s.clone()))
    }
}

/// A step backed by an external program.
///
/// The workflow state is written to the program's stdin as JSON. Stdout is
/// read as a [`StepOutput`] object when it has `result` or `updates` keys,
/// as a bare JSON result otherwise, and as a plain string when it is not
/// JSON at all. A non-zero exit or a timeout fails the step.
pub struct CommandStep {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl CommandStep {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout: Duration::from_secs(default_timeout_secs()),
            working_dir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn run(&self, state: WorkflowState) -> Result<StepOutput> {
        let input = serde_json::to_vec(&state)?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(step = %self.name, program = %self.program, "Spawning step command");
        // Spawn, stdin and wait share one deadline; kill_on_drop reaps the
        // child when it passes.
        let run = async {
            let mut child = cmd.spawn().map_err(|e| {
                OverseerError::step(&self.name, format!("spawn {}: {}", self.program, e))
            })?;

            if let Some(mut stdin) = child.stdin.take() {
                // A program that ignores stdin may close it early.
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(step = %self.name, error = %e, "Step command closed stdin");
                }
            }

            child
                .wait_with_output()
                .await
                .map_err(|e| OverseerError::step(&self.name, e.to_string()))
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(OverseerError::StepTimeout {
                    step: self.name.clone(),
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OverseerError::step(
                &self.name,
                format!("exit code {}: {}", code, stderr.trim()),
            ));
        }

        Ok(parse_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn default_timeout_secs() -> u64 { 120 }

impl Step for CommandStep {
    fn execute(&self, state: WorkflowState) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(self.run(state))
    }
}

/// Interpret a command's stdout.
pub fn parse_output(stdout: &str) -> StepOutput {
    let text = stdout.trim();
    if text.is_empty() {
        return StepOutput::default();
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(obj))
            if obj.contains_key("result") || obj.contains_key("updates") =>
        {
            let value = serde_json::Value::Object(obj);
            serde_json::from_value::<StepOutput>(value.clone())
                .unwrap_or_else(|_| StepOutput::new(value))
        }
        Ok(value) => StepOutput::new(value),
        Err(_) => StepOutput::new(serde_json::Value::String(text.to_string())),
    }
}
