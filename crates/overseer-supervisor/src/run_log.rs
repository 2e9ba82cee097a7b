use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use overseer_core::event::EventBus;
use overseer_core::types::WorkflowEvent;

/// JSONL workflow logger.
///
/// Subscribes to the EventBus and writes one JSON object per line to
/// `{log_dir}/{workflow_id}/{timestamp}.jsonl`. Lines are flushed as they
/// are written, so a crashed run still leaves a readable prefix.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    workflow_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    iteration: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = workflow start/finish, 2 = per-node,
    /// 3 = every recovery attempt and circuit transition.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in a background task. Subscribing before the
    /// spawn means no event published after this call is missed.
    pub fn spawn(
        self,
        event_bus: &Arc<EventBus>,
        workflow_id: String,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<PathBuf>> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, workflow_id, cancel))
    }

    /// Write entries until the workflow completes, the bus closes or
    /// `cancel` fires. Returns the log file path when one was opened.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        workflow_id: String,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let dir = self.log_dir.join(&workflow_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&workflow_id, &event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(&event, WorkflowEvent::WorkflowCompleted { workflow_id: id, .. } if *id == workflow_id) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Minimum level at which an event is written.
    fn level_of(event: &WorkflowEvent) -> u8 {
        match event {
            WorkflowEvent::WorkflowStarted { .. } | WorkflowEvent::WorkflowCompleted { .. } => 1,
            WorkflowEvent::RecoveryAttempted { .. } | WorkflowEvent::CircuitOpened { .. } => 3,
            _ => 2,
        }
    }

    /// Convert an event to a log entry. `None` when the level filters it or
    /// it belongs to another workflow.
    fn event_to_entry(&self, workflow_id: &str, event: &WorkflowEvent) -> Option<LogEntry> {
        if Self::level_of(event) > self.level {
            return None;
        }

        let (owner, iteration) = match event {
            WorkflowEvent::WorkflowStarted { workflow_id, .. }
            | WorkflowEvent::NodeEscalated { workflow_id, .. } => (Some(workflow_id), None),
            WorkflowEvent::NodeStarted { workflow_id, iteration, .. }
            | WorkflowEvent::NodeCompleted { workflow_id, iteration, .. }
            | WorkflowEvent::NodeFailed { workflow_id, iteration, .. }
            | WorkflowEvent::CheckpointSaved { workflow_id, iteration, .. } => {
                (Some(workflow_id), Some(*iteration))
            }
            WorkflowEvent::WorkflowCompleted { workflow_id, total_iterations, .. } => {
                (Some(workflow_id), Some(*total_iterations))
            }
            WorkflowEvent::StuckIssueDetected { issue } => (issue.workflow_id.as_ref(), None),
            WorkflowEvent::RecoveryAttempted { .. } | WorkflowEvent::CircuitOpened { .. } => {
                (None, None)
            }
        };
        if owner.is_some_and(|id| id != workflow_id) {
            return None;
        }

        let detail = match serde_json::to_value(event) {
            Ok(serde_json::Value::Object(mut obj)) => {
                obj.remove("type");
                obj.remove("workflow_id");
                (!obj.is_empty()).then_some(serde_json::Value::Object(obj))
            }
            _ => None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            workflow_id: workflow_id.to_string(),
            event_type: event.kind(),
            iteration,
            detail,
        })
    }
}
