use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use overseer_core::config::EscalationConfig;
use overseer_core::traits::Step;
use overseer_core::types::{StepOutput, WorkflowState};
use overseer_core::Clock;

use crate::step::StepRegistry;

/// Remediation tier for a blocked task. Levels only climb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    /// Re-run the step with its captured input.
    AutomaticRetry,
    /// Try a different registered step.
    SupervisorIntervention,
    /// Hand over to a human.
    ManualEscalation,
}

impl EscalationLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::AutomaticRetry => 1,
            Self::SupervisorIntervention => 2,
            Self::ManualEscalation => 3,
        }
    }
}

/// A step failure that escalation has not resolved yet.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedTask {
    pub task_id: String,
    pub step: String,
    pub error: String,
    pub level: EscalationLevel,
    pub retry_count: u32,
    pub max_retries: u32,
    /// State snapshot the step failed with.
    pub input: WorkflowState,
    pub blocked_at: DateTime<Utc>,
}

/// Audit record produced at level 3.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationRecord {
    pub task_id: String,
    pub step: String,
    pub error: String,
    pub retry_count: u32,
    /// Level-2 substitute that was tried, if one existed.
    pub alternative_tried: Option<String>,
    pub input: WorkflowState,
    pub escalated_at: DateTime<Utc>,
    pub status: String,
}

pub const AWAITING_HUMAN: &str = "awaiting_human_intervention";

#[derive(Debug, Clone)]
pub enum EscalationOutcome {
    /// Level 1 or 2 produced an output; the task is no longer blocked.
    Resolved {
        output: StepOutput,
        level: EscalationLevel,
        alternative_used: Option<String>,
    },
    /// Level 3 reached; the workflow needs a human.
    Escalated(EscalationRecord),
}

/// Three-level escalation for failed steps, scoped to one workflow run.
pub struct EscalationHandler {
    max_retries: u32,
    clock: Arc<dyn Clock>,
    blocked: Mutex<HashMap<String, BlockedTask>>,
    records: Mutex<Vec<EscalationRecord>>,
}

impl EscalationHandler {
    pub fn new(config: &EscalationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_retries: config.max_retries,
            clock,
            blocked: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    fn blocked(&self) -> MutexGuard<'_, HashMap<String, BlockedTask>> {
        self.blocked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn records(&self) -> MutexGuard<'_, Vec<EscalationRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Climb the escalation ladder for `task_id` until a level resolves it.
    ///
    /// A task already known to the handler resumes at its current level.
    pub async fn escalate(
        &self,
        task_id: &str,
        step_name: &str,
        step: Arc<dyn Step>,
        input: &WorkflowState,
        error_msg: &str,
        registry: &StepRegistry,
    ) -> EscalationOutcome {
        let mut task = {
            let mut blocked = self.blocked();
            blocked
                .entry(task_id.to_string())
                .or_insert_with(|| BlockedTask {
                    task_id: task_id.to_string(),
                    step: step_name.to_string(),
                    error: error_msg.to_string(),
                    level: EscalationLevel::AutomaticRetry,
                    retry_count: 0,
                    max_retries: self.max_retries,
                    input: input.clone(),
                    blocked_at: self.clock.now(),
                })
                .clone()
        };

        if task.level == EscalationLevel::AutomaticRetry {
            while task.retry_count < task.max_retries {
                task.retry_count += 1;
                self.store(&task);
                info!(task_id, step = step_name, retry = task.retry_count, "Escalation level 1: retrying step");
                match step.execute(task.input.clone()).await {
                    Ok(output) => {
                        self.resolve(task_id);
                        return EscalationOutcome::Resolved {
                            output,
                            level: EscalationLevel::AutomaticRetry,
                            alternative_used: None,
                        };
                    }
                    Err(e) => task.error = e.to_string(),
                }
            }
            task.level = EscalationLevel::SupervisorIntervention;
            self.store(&task);
        }

        let mut alternative_tried = None;
        if task.level == EscalationLevel::SupervisorIntervention {
            if let Some((alt_name, alt)) = registry.first_other(step_name) {
                warn!(task_id, step = step_name, alternative = %alt_name, "Escalation level 2: trying alternative step");
                alternative_tried = Some(alt_name.clone());
                match alt.execute(task.input.clone()).await {
                    Ok(output) => {
                        self.resolve(task_id);
                        return EscalationOutcome::Resolved {
                            output,
                            level: EscalationLevel::SupervisorIntervention,
                            alternative_used: Some(alt_name),
                        };
                    }
                    Err(e) => task.error = e.to_string(),
                }
            }
            task.level = EscalationLevel::ManualEscalation;
            self.store(&task);
        }

        // Level 3: a task that already escalated keeps its first record.
        if let Some(existing) = self.records().iter().find(|r| r.task_id == task_id) {
            return EscalationOutcome::Escalated(existing.clone());
        }

        let record = EscalationRecord {
            task_id: task.task_id.clone(),
            step: task.step.clone(),
            error: task.error.clone(),
            retry_count: task.retry_count,
            alternative_tried,
            input: task.input.clone(),
            escalated_at: self.clock.now(),
            status: AWAITING_HUMAN.to_string(),
        };
        error!(task_id, step = step_name, error = %record.error, "Escalation level 3: manual intervention required");
        self.records().push(record.clone());
        EscalationOutcome::Escalated(record)
    }

    fn store(&self, task: &BlockedTask) {
        self.blocked().insert(task.task_id.clone(), task.clone());
    }

    fn resolve(&self, task_id: &str) {
        self.blocked().remove(task_id);
    }

    /// Forget a task so its next escalation starts at level 1 again.
    pub fn reset(&self, task_id: &str) -> bool {
        self.records().retain(|r| r.task_id != task_id);
        self.blocked().remove(task_id).is_some()
    }

    /// Tasks not yet resolved, level-3 ones included, ordered by task id.
    pub fn blocked_tasks(&self) -> Vec<BlockedTask> {
        let mut tasks: Vec<BlockedTask> = self.blocked().values().cloned().collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        tasks
    }

    pub fn level(&self, task_id: &str) -> Option<EscalationLevel> {
        self.blocked().get(task_id).map(|t| t.level)
    }

    pub fn escalation_records(&self) -> Vec<EscalationRecord> {
        self.records().clone()
    }
}
