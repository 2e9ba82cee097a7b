use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use overseer_core::config::RecoveryConfig;
use overseer_core::traits::Step;
use overseer_core::types::{RecoveryStrategy, StepOutput, WorkflowEvent, WorkflowState};
use overseer_core::{Clock, EventBus};

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakers};

/// Name under which a step's substitute is registered.
pub fn alternative_name(step: &str) -> String {
    format!("{}_fallback", step)
}

/// Delay before retry `attempt` under `strategy`. The first try never waits.
pub fn retry_delay(
    strategy: RecoveryStrategy,
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
) -> Duration {
    match strategy {
        RecoveryStrategy::ExponentialBackoff if attempt > 0 => {
            let base_ms = base_delay.as_millis().min(u64::MAX as u128) as u64;
            let factor = 2u64.saturating_pow(attempt - 1);
            Duration::from_millis(base_ms.saturating_mul(factor)).min(max_delay)
        }
        _ => Duration::ZERO,
    }
}

/// Strategy consulted for a given attempt: round-robin over the list.
fn strategy_for(strategies: &[RecoveryStrategy], attempt: u32) -> RecoveryStrategy {
    if strategies.is_empty() {
        return RecoveryStrategy::ImmediateRetry;
    }
    strategies[attempt as usize % strategies.len()]
}

/// One execution try, kept in the engine's history.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub step: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Fallback,
    Failed,
}

/// What [`RecoveryEngine::execute_with_recovery`] resolved to.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    /// The step originally requested.
    pub step: String,
    pub status: OutcomeStatus,
    pub output: Option<StepOutput>,
    pub error: Option<String>,
    /// Failed tries before the successful one.
    pub recovery_attempts: u32,
    pub recovery_applied: bool,
    pub circuit_breaker_triggered: bool,
    /// Name of the substitute step that produced the output, if any.
    pub alternative_used: Option<String>,
}

impl ExecutionOutcome {
    /// Success or fallback: the node has an output to merge.
    pub fn has_output(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success | OutcomeStatus::Fallback)
    }

    fn failed(step: &str, error: String, circuit_breaker_triggered: bool) -> Self {
        Self {
            step: step.to_string(),
            status: OutcomeStatus::Failed,
            output: None,
            error: Some(error),
            recovery_attempts: 0,
            recovery_applied: true,
            circuit_breaker_triggered,
            alternative_used: None,
        }
    }

    fn fallback(step: &str, result: &serde_json::Value, error: String) -> Self {
        Self {
            step: step.to_string(),
            status: OutcomeStatus::Fallback,
            output: Some(StepOutput::new(result.clone())),
            error: Some(error),
            recovery_attempts: 0,
            recovery_applied: true,
            circuit_breaker_triggered: false,
            alternative_used: None,
        }
    }
}

/// Aggregate view over the attempt history.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    pub total_attempts: usize,
    pub successful_attempts: usize,
    pub failed_attempts: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub strategies_used: BTreeMap<String, usize>,
    pub circuit_breakers: Vec<BreakerSnapshot>,
}

/// Runs steps through retries, alternatives and fallbacks.
pub struct RecoveryEngine {
    config: RecoveryConfig,
    breakers: Arc<CircuitBreakers>,
    clock: Arc<dyn Clock>,
    event_bus: Option<Arc<EventBus>>,
    history: Mutex<Vec<RecoveryAttempt>>,
}

impl RecoveryEngine {
    pub fn new(
        config: RecoveryConfig,
        breakers: Arc<CircuitBreakers>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            breakers,
            clock,
            event_bus: None,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    fn history(&self) -> MutexGuard<'_, Vec<RecoveryAttempt>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    /// Execute `step` with the configured strategy list.
    pub async fn execute(
        &self,
        step_name: &str,
        step: Arc<dyn Step>,
        input: &WorkflowState,
        alternatives: &HashMap<String, Arc<dyn Step>>,
        fallback_result: Option<&serde_json::Value>,
    ) -> ExecutionOutcome {
        let strategies = self.config.strategies.clone();
        self.execute_with_recovery(step_name, step, input, &strategies, alternatives, fallback_result)
            .await
    }

    /// Execute `step` under an explicit strategy list.
    ///
    /// The breaker for the running step is consulted first. Each step then
    /// gets up to `max_retries + 1` tries, and every failed try counts
    /// against its breaker. Exhausting them moves on to the `<name>_fallback` alternative
    /// (when `AlternativeAgent` is listed), then to `fallback_result` (when
    /// `FallbackDefault` is listed).
    pub async fn execute_with_recovery(
        &self,
        step_name: &str,
        step: Arc<dyn Step>,
        input: &WorkflowState,
        strategies: &[RecoveryStrategy],
        alternatives: &HashMap<String, Arc<dyn Step>>,
        fallback_result: Option<&serde_json::Value>,
    ) -> ExecutionOutcome {
        let mut strategies = strategies.to_vec();
        let mut current_name = step_name.to_string();
        let mut current_step = step;
        let mut alternative_used: Option<String> = None;

        loop {
            if !self.breakers.allow(&current_name) {
                warn!(step = %current_name, "Circuit open, skipping execution");

                if let Some((name, alt)) = self.take_alternative(&current_name, &mut strategies, alternatives) {
                    alternative_used = Some(name.clone());
                    current_name = name;
                    current_step = alt;
                    continue;
                }
                // An open circuit falls back whenever a fixed result exists.
                if let Some(result) = fallback_result {
                    let mut out = ExecutionOutcome::fallback(
                        step_name,
                        result,
                        format!("circuit open for {}", current_name),
                    );
                    out.circuit_breaker_triggered = true;
                    out.alternative_used = alternative_used;
                    return out;
                }
                let mut out = ExecutionOutcome::failed(
                    step_name,
                    format!("circuit open for {}", current_name),
                    true,
                );
                out.recovery_applied = alternative_used.is_some();
                out.alternative_used = alternative_used;
                return out;
            }

            let mut last_error = String::new();
            for attempt in 0..=self.config.max_retries {
                let strategy = strategy_for(&strategies, attempt);
                if attempt > 0 {
                    let delay = retry_delay(
                        strategy,
                        attempt,
                        Duration::from_millis(self.config.base_delay_ms),
                        Duration::from_millis(self.config.max_delay_ms),
                    );
                    if !delay.is_zero() {
                        debug!(step = %current_name, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                        tokio::time::sleep(delay).await;
                    }
                }

                let started = Instant::now();
                let result = current_step.execute(input.clone()).await;
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

                let (success, error) = match &result {
                    Ok(_) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                };
                self.record_attempt(RecoveryAttempt {
                    step: current_name.clone(),
                    attempt,
                    timestamp: self.clock.now(),
                    strategy,
                    success,
                    error,
                    duration_ms,
                });

                match result {
                    Ok(output) => {
                        if attempt > 0 || alternative_used.is_some() {
                            info!(step = %current_name, attempt, "Step recovered");
                        }
                        return ExecutionOutcome {
                            step: step_name.to_string(),
                            status: OutcomeStatus::Success,
                            output: Some(output),
                            error: None,
                            recovery_attempts: attempt,
                            recovery_applied: attempt > 0 || alternative_used.is_some(),
                            circuit_breaker_triggered: false,
                            alternative_used,
                        };
                    }
                    Err(e) => {
                        warn!(step = %current_name, attempt, strategy = %strategy, error = %e, "Step attempt failed");
                        last_error = e.to_string();
                        if self.breakers.record_failure(&current_name) {
                            self.publish(WorkflowEvent::CircuitOpened {
                                step: current_name.clone(),
                                failure_count: self.breakers.failure_count(&current_name),
                            });
                        }
                    }
                }
            }

            if let Some((name, alt)) = self.take_alternative(&current_name, &mut strategies, alternatives) {
                info!(step = %current_name, alternative = %name, "Retries exhausted, trying alternative");
                alternative_used = Some(name.clone());
                current_name = name;
                current_step = alt;
                continue;
            }

            if strategies.contains(&RecoveryStrategy::FallbackDefault) {
                if let Some(result) = fallback_result {
                    info!(step = %step_name, "Retries exhausted, using fallback result");
                    let mut out = ExecutionOutcome::fallback(step_name, result, last_error);
                    out.alternative_used = alternative_used;
                    return out;
                }
            }

            let mut out = ExecutionOutcome::failed(
                step_name,
                last_error,
                self.breakers.is_open(&current_name),
            );
            out.alternative_used = alternative_used;
            return out;
        }
    }

    /// Switch to `<step>_fallback` if the strategy list allows it. The
    /// alternative runs without `AlternativeAgent`, so chains stop after one hop.
    fn take_alternative(
        &self,
        step: &str,
        strategies: &mut Vec<RecoveryStrategy>,
        alternatives: &HashMap<String, Arc<dyn Step>>,
    ) -> Option<(String, Arc<dyn Step>)> {
        if !strategies.contains(&RecoveryStrategy::AlternativeAgent) {
            return None;
        }
        let name = alternative_name(step);
        let alt = alternatives.get(&name)?.clone();
        strategies.retain(|s| *s != RecoveryStrategy::AlternativeAgent);
        Some((name, alt))
    }

    fn record_attempt(&self, attempt: RecoveryAttempt) {
        self.publish(WorkflowEvent::RecoveryAttempted {
            step: attempt.step.clone(),
            attempt: attempt.attempt,
            strategy: attempt.strategy,
            success: attempt.success,
            duration_ms: attempt.duration_ms,
        });
        self.history().push(attempt);
    }

    /// Every attempt recorded so far, oldest first.
    pub fn attempts(&self) -> Vec<RecoveryAttempt> {
        self.history().clone()
    }

    pub fn stats(&self) -> RecoveryStats {
        let history = self.history();
        let total = history.len();
        let successful = history.iter().filter(|a| a.success).count();
        let mut strategies_used = BTreeMap::new();
        for a in history.iter() {
            *strategies_used.entry(a.strategy.as_str().to_string()).or_insert(0) += 1;
        }
        let (success_rate, average_duration_ms) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                successful as f64 / total as f64,
                history.iter().map(|a| a.duration_ms).sum::<f64>() / total as f64,
            )
        };

        RecoveryStats {
            total_attempts: total,
            successful_attempts: successful,
            failed_attempts: total - successful,
            success_rate,
            average_duration_ms,
            strategies_used,
            circuit_breakers: self.breakers.snapshot(),
        }
    }

    pub fn reset_circuit_breakers(&self) {
        self.breakers.reset_all();
    }

    pub fn clear_history(&self) {
        self.history().clear();
    }
}
