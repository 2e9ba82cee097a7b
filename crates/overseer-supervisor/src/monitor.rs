use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use overseer_core::config::MonitorConfig;
use overseer_core::error::Result;
use overseer_core::traits::IssueHandler;
use overseer_core::types::{IssueSeverity, IssueType, StuckIssue, WorkflowEvent};
use overseer_core::{Clock, EventBus};

/// A watched step: the run it belongs to (none when watched by name only)
/// and the step name.
type StepKey = (Option<String>, String);

#[derive(Debug, Clone)]
struct StepTracking {
    started_at: DateTime<Utc>,
    last_progress: DateTime<Utc>,
    iterations: usize,
}

#[derive(Debug, Clone)]
struct WorkflowTracking {
    started_at: DateTime<Utc>,
    last_progress: DateTime<Utc>,
    completed_nodes: Vec<String>,
    total_iterations: usize,
}

/// Counts over the active issues.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IssueSummary {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_subject: BTreeMap<String, usize>,
}

fn secs(s: u64) -> chrono::Duration {
    chrono::Duration::seconds(s.min(i64::MAX as u64 / 1000) as i64)
}

/// Flags steps and workflows that stop making progress.
///
/// Steps are tracked per run and step name, workflows per id. Every run
/// that reports into the same monitor shares the tables. Detection runs on [`scan`], either
/// called directly or from the background loop started by [`start`].
///
/// [`scan`]: LivenessMonitor::scan
/// [`start`]: LivenessMonitor::start
pub struct LivenessMonitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    event_bus: Option<Arc<EventBus>>,
    steps: Mutex<HashMap<StepKey, StepTracking>>,
    workflows: Mutex<HashMap<String, WorkflowTracking>>,
    issues: Mutex<Vec<StuckIssue>>,
    last_reported: Mutex<HashMap<(String, IssueType), DateTime<Utc>>>,
    handlers: Mutex<Vec<Arc<dyn IssueHandler>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LivenessMonitor {
    pub fn new(config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            event_bus: None,
            steps: Mutex::new(HashMap::new()),
            workflows: Mutex::new(HashMap::new()),
            issues: Mutex::new(Vec::new()),
            last_reported: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Add a callback run for every newly detected issue.
    pub fn add_handler(&self, handler: Arc<dyn IssueHandler>) {
        lock(&self.handlers).push(handler);
    }

    // ── Tracking ────────────────────────────────────────────────

    /// Start tracking a running step by name alone.
    pub fn watch_step(&self, step: &str) {
        self.track_step((None, step.to_string()));
    }

    /// Start tracking a step running inside `workflow_id`. Runs executing a
    /// step of the same name are tracked apart.
    pub fn watch_run_step(&self, workflow_id: &str, step: &str) {
        self.track_step((Some(workflow_id.to_string()), step.to_string()));
    }

    fn track_step(&self, key: StepKey) {
        let now = self.clock.now();
        lock(&self.steps).insert(
            key,
            StepTracking {
                started_at: now,
                last_progress: now,
                iterations: 0,
            },
        );
    }

    /// Mark progress for every tracked step with this name.
    pub fn record_step_progress(&self, step: &str) {
        let now = self.clock.now();
        for ((_, name), t) in lock(&self.steps).iter_mut() {
            if name == step {
                t.last_progress = now;
                t.iterations += 1;
            }
        }
    }

    /// Stop tracking a step watched by name. Returns whether it was tracked.
    pub fn unwatch_step(&self, step: &str) -> bool {
        lock(&self.steps).remove(&(None, step.to_string())).is_some()
    }

    pub fn unwatch_run_step(&self, workflow_id: &str, step: &str) -> bool {
        lock(&self.steps)
            .remove(&(Some(workflow_id.to_string()), step.to_string()))
            .is_some()
    }

    pub fn watch_workflow(&self, workflow_id: &str) {
        let now = self.clock.now();
        lock(&self.workflows).insert(
            workflow_id.to_string(),
            WorkflowTracking {
                started_at: now,
                last_progress: now,
                completed_nodes: Vec::new(),
                total_iterations: 0,
            },
        );
    }

    /// Record an executor iteration. Progress only counts when the completed
    /// node list grew; iterations always count.
    pub fn record_workflow_progress(
        &self,
        workflow_id: &str,
        completed_nodes: &[String],
        total_iterations: usize,
    ) {
        let now = self.clock.now();
        let mut workflows = lock(&self.workflows);
        let t = workflows
            .entry(workflow_id.to_string())
            .or_insert_with(|| WorkflowTracking {
                started_at: now,
                last_progress: now,
                completed_nodes: Vec::new(),
                total_iterations: 0,
            });
        if completed_nodes.len() > t.completed_nodes.len() {
            t.last_progress = now;
            t.completed_nodes = completed_nodes.to_vec();
        }
        t.total_iterations = total_iterations;
    }

    pub fn unwatch_workflow(&self, workflow_id: &str) -> bool {
        lock(&self.workflows).remove(workflow_id).is_some()
    }

    /// Names of the tracked steps, sorted and without repeats.
    pub fn watched_steps(&self) -> Vec<String> {
        let mut v: Vec<String> = lock(&self.steps).keys().map(|(_, name)| name.clone()).collect();
        v.sort();
        v.dedup();
        v
    }

    pub fn watched_workflows(&self) -> Vec<String> {
        let mut v: Vec<String> = lock(&self.workflows).keys().cloned().collect();
        v.sort();
        v
    }

    // ── Detection ───────────────────────────────────────────────

    /// Detect issues and record the ones not suppressed by deduplication.
    /// Handlers are not called.
    pub fn check(&self) -> Vec<StuckIssue> {
        let now = self.clock.now();
        let threshold = secs(self.config.timeout_threshold_secs);
        let mut candidates = Vec::new();

        for ((workflow_id, name), t) in lock(&self.steps).iter() {
            let running = now - t.started_at;
            if running > threshold {
                candidates.push(self.build_issue(
                    IssueType::Timeout,
                    IssueSeverity::High,
                    name,
                    workflow_id.clone(),
                    format!("Step '{}' has been running for {}s", name, running.num_seconds()),
                    serde_json::json!({
                        "started_at": t.started_at,
                        "elapsed_secs": running.num_seconds(),
                        "threshold_secs": self.config.timeout_threshold_secs,
                    }),
                    now,
                ));
            }
            let idle = now - t.last_progress;
            if idle > threshold {
                candidates.push(self.build_issue(
                    IssueType::NoProgress,
                    IssueSeverity::Medium,
                    name,
                    workflow_id.clone(),
                    format!("Step '{}' has made no progress for {}s", name, idle.num_seconds()),
                    serde_json::json!({
                        "last_progress": t.last_progress,
                        "iterations": t.iterations,
                    }),
                    now,
                ));
            }
        }

        for (id, t) in lock(&self.workflows).iter() {
            let idle = now - t.last_progress;
            if idle > threshold && t.total_iterations > self.config.max_iterations_without_progress {
                candidates.push(self.build_issue(
                    IssueType::Blocked,
                    IssueSeverity::Critical,
                    id,
                    Some(id.clone()),
                    format!(
                        "Workflow '{}' ran {} iterations without completing a node for {}s",
                        id,
                        t.total_iterations,
                        idle.num_seconds()
                    ),
                    serde_json::json!({
                        "started_at": t.started_at,
                        "completed_nodes": t.completed_nodes,
                        "total_iterations": t.total_iterations,
                    }),
                    now,
                ));
            }
        }

        self.prune(now);
        candidates
            .into_iter()
            .filter_map(|issue| self.record(issue))
            .collect()
    }

    /// Run one detection pass and notify handlers of each new issue.
    pub async fn scan(&self) -> Vec<StuckIssue> {
        let found = self.check();
        for issue in &found {
            self.notify(issue).await;
        }
        found
    }

    /// Record an externally detected issue (e.g. `infinite_loop`,
    /// `deadlock`) and notify handlers. `None` when deduplicated.
    pub async fn report_issue(
        &self,
        issue_type: IssueType,
        severity: IssueSeverity,
        subject: &str,
        workflow_id: Option<String>,
        description: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Option<StuckIssue> {
        let now = self.clock.now();
        let issue = self.build_issue(
            issue_type,
            severity,
            subject,
            workflow_id,
            description.into(),
            metadata,
            now,
        );
        let issue = self.record(issue)?;
        self.notify(&issue).await;
        Some(issue)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_issue(
        &self,
        issue_type: IssueType,
        severity: IssueSeverity,
        subject: &str,
        workflow_id: Option<String>,
        description: String,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StuckIssue {
        StuckIssue {
            issue_id: format!("{}_{}_{}", issue_type, subject, now.timestamp()),
            issue_type,
            severity,
            subject: subject.to_string(),
            workflow_id,
            description,
            detected_at: now,
            metadata,
        }
    }

    /// Store an issue unless the same subject and type were reported within
    /// the dedup window.
    fn record(&self, issue: StuckIssue) -> Option<StuckIssue> {
        let key = (issue.subject.clone(), issue.issue_type);
        let window = secs(self.config.dedup_window_secs);
        {
            let mut last = lock(&self.last_reported);
            if let Some(prev) = last.get(&key) {
                if issue.detected_at - *prev < window {
                    debug!(subject = %issue.subject, issue_type = %issue.issue_type, "Duplicate issue suppressed");
                    return None;
                }
            }
            last.insert(key, issue.detected_at);
        }

        warn!(
            issue_id = %issue.issue_id,
            issue_type = %issue.issue_type,
            severity = issue.severity.as_str(),
            subject = %issue.subject,
            "Stuck issue detected"
        );
        lock(&self.issues).push(issue.clone());
        if let Some(bus) = &self.event_bus {
            bus.publish(WorkflowEvent::StuckIssueDetected {
                issue: issue.clone(),
            });
        }
        Some(issue)
    }

    fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - secs(self.config.retention_secs);
        lock(&self.issues).retain(|i| i.detected_at >= cutoff);
        lock(&self.last_reported).retain(|_, t| *t >= cutoff);
    }

    /// Run every handler with a bounded timeout. Failures are logged only.
    async fn notify(&self, issue: &StuckIssue) {
        let handlers: Vec<Arc<dyn IssueHandler>> = lock(&self.handlers).clone();
        let limit = Duration::from_secs(self.config.callback_timeout_secs);
        for handler in handlers {
            match tokio::time::timeout(limit, handler.handle(issue.clone())).await {
                Ok(Ok(handled)) => {
                    debug!(issue_id = %issue.issue_id, handled, "Issue handler finished");
                }
                Ok(Err(e)) => {
                    error!(issue_id = %issue.issue_id, error = %e, "Issue handler failed");
                }
                Err(_) => {
                    error!(
                        issue_id = %issue.issue_id,
                        timeout_secs = self.config.callback_timeout_secs,
                        "Issue handler timed out"
                    );
                }
            }
        }
    }

    // ── Views ───────────────────────────────────────────────────

    /// Issues detected within the retention window, oldest first.
    pub fn active_issues(&self) -> Vec<StuckIssue> {
        let cutoff = self.clock.now() - secs(self.config.retention_secs);
        lock(&self.issues)
            .iter()
            .filter(|i| i.detected_at >= cutoff)
            .cloned()
            .collect()
    }

    pub fn issue_summary(&self) -> IssueSummary {
        let active = self.active_issues();
        let mut summary = IssueSummary {
            total: active.len(),
            ..IssueSummary::default()
        };
        for issue in &active {
            *summary.by_type.entry(issue.issue_type.to_string()).or_insert(0) += 1;
            *summary
                .by_severity
                .entry(issue.severity.as_str().to_string())
                .or_insert(0) += 1;
            *summary.by_subject.entry(issue.subject.clone()).or_insert(0) += 1;
        }
        summary
    }

    // ── Background loop ─────────────────────────────────────────

    /// Spawn the periodic scan loop. Calling `start` while running restarts it.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let token = CancellationToken::new();
        if let Some(old) = lock(&self.cancel).replace(token.clone()) {
            old.cancel();
        }

        let monitor = Arc::clone(self);
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Liveness monitor started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Liveness monitor shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let found = monitor.scan().await;
                        if !found.is_empty() {
                            info!(count = found.len(), "Liveness scan found issues");
                        }
                    }
                }
            }
        })
    }

    /// Stop the background loop. Returns immediately; an in-flight scan
    /// finishes on its own.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.cancel)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}

/// Dispatches issues to a handler per issue type.
#[derive(Default)]
pub struct IssueRouter {
    routes: HashMap<IssueType, Arc<dyn IssueHandler>>,
}

impl IssueRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, issue_type: IssueType, handler: Arc<dyn IssueHandler>) -> Self {
        self.routes.insert(issue_type, handler);
        self
    }
}

impl IssueHandler for IssueRouter {
    fn handle(&self, issue: StuckIssue) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            match self.routes.get(&issue.issue_type) {
                Some(handler) => handler.handle(issue).await,
                None => {
                    debug!(issue_type = %issue.issue_type, "No route for issue type");
                    Ok(false)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::error::OverseerError;
    use overseer_core::traits::FnIssueHandler;
    use overseer_test_utils::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor(clock: Arc<ManualClock>) -> LivenessMonitor {
        LivenessMonitor::new(
            MonitorConfig {
                enabled: true,
                timeout_threshold_secs: 300,
                max_iterations_without_progress: 10,
                ..MonitorConfig::default()
            },
            clock,
        )
    }

    #[test]
    fn test_timeout_and_no_progress_detected() {
        let clock = ManualClock::fixed();
        let m = monitor(clock.clone());
        m.watch_step("crawl");

        clock.advance_secs(200);
        assert!(m.check().is_empty());

        clock.advance_secs(101);
        let found = m.check();
        let types: Vec<IssueType> = found.iter().map(|i| i.issue_type).collect();
        assert!(types.contains(&IssueType::Timeout));
        assert!(types.contains(&IssueType::NoProgress));
        let timeout = found.iter().find(|i| i.issue_type == IssueType::Timeout).unwrap();
        assert_eq!(timeout.severity, IssueSeverity::High);
        assert!(timeout.issue_id.starts_with("timeout_crawl_"));
    }

    #[test]
    fn test_progress_suppresses_no_progress() {
        let clock = ManualClock::fixed();
        let m = monitor(clock.clone());
        m.watch_step("crawl");
        clock.advance_secs(250);
        m.record_step_progress("crawl");
        clock.advance_secs(100);

        let found = m.check();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].issue_type, IssueType::Timeout);
    }

    #[test]
    fn test_duplicate_timeouts_within_window_reported_once() {
        let clock = ManualClock::fixed();
        let m = monitor(clock.clone());
        m.watch_step("crawl");
        clock.advance_secs(301);
        m.check();
        clock.advance_secs(30);
        m.check();

        let timeouts = m
            .active_issues()
            .into_iter()
            .filter(|i| i.issue_type == IssueType::Timeout)
            .count();
        assert_eq!(timeouts, 1);

        // Past the window the same pair is reported again.
        clock.advance_secs(31);
        assert!(m.check().iter().any(|i| i.issue_type == IssueType::Timeout));
    }

    #[test]
    fn test_blocked_workflow_needs_iterations_and_idle_time() {
        let clock = ManualClock::fixed();
        let m = monitor(clock.clone());
        m.watch_workflow("wf-1");
        m.record_workflow_progress("wf-1", &["a".to_string()], 3);
        clock.advance_secs(400);
        assert!(m.check().is_empty());

        m.record_workflow_progress("wf-1", &["a".to_string()], 11);
        let found = m.check();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].issue_type, IssueType::Blocked);
        assert_eq!(found[0].severity, IssueSeverity::Critical);
        assert_eq!(found[0].workflow_id.as_deref(), Some("wf-1"));
    }

    #[test]
    fn test_issues_drop_out_after_retention() {
        let clock = ManualClock::fixed();
        let m = monitor(clock.clone());
        m.watch_step("crawl");
        clock.advance_secs(301);
        m.check();
        m.unwatch_step("crawl");
        assert_eq!(m.active_issues().len(), 2);

        clock.advance_secs(3601);
        assert!(m.active_issues().is_empty());
        m.check();
        assert!(m.issue_summary().total == 0);
    }

    #[tokio::test]
    async fn test_handler_errors_are_swallowed() {
        let clock = ManualClock::fixed();
        let m = monitor(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        m.add_handler(Arc::new(FnIssueHandler(|_: &StuckIssue| {
            Err(OverseerError::step("handler", "boom"))
        })));
        m.add_handler(Arc::new(FnIssueHandler(move |_: &StuckIssue| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })));

        m.watch_step("crawl");
        clock.advance_secs(301);
        let found = m.scan().await;
        assert_eq!(found.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_runs_sharing_a_step_name_are_tracked_apart() {
        let clock = ManualClock::fixed();
        let m = monitor(clock.clone());
        m.watch_run_step("wf-a", "crawl");
        m.watch_run_step("wf-b", "crawl");
        assert_eq!(m.watched_steps(), vec!["crawl"]);

        // wf-a finishing its step leaves wf-b's tracking in place.
        assert!(m.unwatch_run_step("wf-a", "crawl"));
        assert!(!m.unwatch_step("crawl"));
        assert_eq!(m.watched_steps(), vec!["crawl"]);

        clock.advance_secs(301);
        let found = m.check();
        let timeout = found.iter().find(|i| i.issue_type == IssueType::Timeout).unwrap();
        assert_eq!(timeout.subject, "crawl");
        assert_eq!(timeout.workflow_id.as_deref(), Some("wf-b"));

        assert!(m.unwatch_run_step("wf-b", "crawl"));
        assert!(m.watched_steps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_handler_is_cut_off_at_callback_timeout() {
        struct Hung;
        impl IssueHandler for Hung {
            fn handle(&self, _issue: StuckIssue) -> BoxFuture<'_, Result<bool>> {
                Box::pin(futures::future::pending::<Result<bool>>())
            }
        }

        let clock = ManualClock::fixed();
        let m = LivenessMonitor::new(
            MonitorConfig {
                enabled: true,
                timeout_threshold_secs: 300,
                callback_timeout_secs: 5,
                ..MonitorConfig::default()
            },
            clock.clone(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        m.add_handler(Arc::new(Hung));
        m.add_handler(Arc::new(FnIssueHandler(move |_: &StuckIssue| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })));

        m.watch_step("crawl");
        clock.advance_secs(301);
        let started = tokio::time::Instant::now();
        let found = m.scan().await;

        // Timeout and no-progress: the hung handler costs 5s for each.
        assert_eq!(found.len(), 2);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_report_issue_and_summary() {
        let m = monitor(ManualClock::fixed());
        let issue = m
            .report_issue(
                IssueType::InfiniteLoop,
                IssueSeverity::High,
                "planner",
                Some("wf-9".into()),
                "planner revisited the same node 40 times",
                serde_json::json!({"visits": 40}),
            )
            .await;
        assert!(issue.is_some());

        let dup = m
            .report_issue(
                IssueType::InfiniteLoop,
                IssueSeverity::High,
                "planner",
                None,
                "again",
                serde_json::Value::Null,
            )
            .await;
        assert!(dup.is_none());

        let summary = m.issue_summary();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.by_type.get("infinite_loop"), Some(&1));
        assert_eq!(summary.by_severity.get("high"), Some(&1));
        assert_eq!(summary.by_subject.get("planner"), Some(&1));
    }

    #[tokio::test]
    async fn test_router_dispatches_by_type() {
        let timeouts = Arc::new(AtomicUsize::new(0));
        let counter = timeouts.clone();
        let router = IssueRouter::new().route(
            IssueType::Timeout,
            Arc::new(FnIssueHandler(move |_: &StuckIssue| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            })),
        );

        let clock = ManualClock::fixed();
        let m = monitor(clock.clone());
        let base = m.build_issue(
            IssueType::Timeout,
            IssueSeverity::High,
            "s",
            None,
            "d".into(),
            serde_json::Value::Null,
            clock.now(),
        );
        assert!(router.handle(base.clone()).await.unwrap());

        let mut deadlock = base;
        deadlock.issue_type = IssueType::Deadlock;
        assert!(!router.handle(deadlock).await.unwrap());
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_scans_until_stopped() {
        let clock = ManualClock::fixed();
        let m = Arc::new(LivenessMonitor::new(
            MonitorConfig {
                enabled: true,
                check_interval_secs: 60,
                timeout_threshold_secs: 10,
                ..MonitorConfig::default()
            },
            clock.clone(),
        ));
        m.watch_step("crawl");
        clock.advance_secs(11);

        let handle = m.start();
        assert!(m.is_running());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!m.active_issues().is_empty());

        m.stop();
        assert!(!m.is_running());
        handle.await.unwrap();
    }
}
