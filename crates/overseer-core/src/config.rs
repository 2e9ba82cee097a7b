use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OverseerError, Result};
use crate::types::RecoveryStrategy;

/// Top-level Overseer configuration.
///
/// Every section has defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Stop dispatching once any node reaches level-3 escalation.
    #[serde(default = "default_true")]
    pub halt_on_escalation: bool,
    /// Run the nodes of one ready set concurrently.
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// Reject graphs whose edges name unregistered guards.
    #[serde(default = "default_true")]
    pub strict_guards: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            halt_on_escalation: true,
            parallel: true,
            strict_guards: true,
        }
    }
}

fn default_true() -> bool { true }
fn default_max_iterations() -> usize { 20 }

/// Recovery engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_strategies")]
    pub strategies: Vec<RecoveryStrategy>,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            strategies: default_strategies(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_strategies() -> Vec<RecoveryStrategy> { vec![RecoveryStrategy::ExponentialBackoff] }
fn default_base_delay() -> u64 { 1000 }
fn default_max_delay() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a step's circuit.
    #[serde(default = "default_cb_threshold")]
    pub threshold: u32,
    /// Seconds after the last failure before an open circuit closes again.
    #[serde(default = "default_cb_reset")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_cb_threshold(),
            reset_timeout_secs: default_cb_reset(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

fn default_cb_threshold() -> u32 { 3 }
fn default_cb_reset() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Level-1 automatic retries before moving to level 2.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
        }
    }
}

/// Liveness monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_timeout_threshold")]
    pub timeout_threshold_secs: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_max_iterations_without_progress")]
    pub max_iterations_without_progress: usize,
    /// Same subject + issue type is reported at most once per window.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    /// Issues older than this drop out of the active view.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_threshold_secs: default_timeout_threshold(),
            check_interval_secs: default_check_interval(),
            max_iterations_without_progress: default_max_iterations_without_progress(),
            dedup_window_secs: default_dedup_window(),
            retention_secs: default_retention(),
            callback_timeout_secs: default_callback_timeout(),
        }
    }
}

fn default_timeout_threshold() -> u64 { 300 }
fn default_check_interval() -> u64 { 60 }
fn default_max_iterations_without_progress() -> usize { 10 }
fn default_dedup_window() -> u64 { 60 }
fn default_retention() -> u64 { 3600 }
fn default_callback_timeout() -> u64 { 10 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = workflow summary only, 2 = per-node, 3 = every recovery attempt (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    pub fn dir(&self) -> PathBuf {
        PathBuf::from(self.log_dir.as_deref().unwrap_or("logs"))
    }
}

fn default_log_level() -> u8 { 2 }

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Enable checkpointing (default: true when section is present).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite file. Default: ./checkpoints.db
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
    /// Save the workflow state after every iteration.
    #[serde(default = "default_true")]
    pub every_iteration: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_checkpoint_path(),
            every_iteration: true,
        }
    }
}

fn default_checkpoint_path() -> String { "checkpoints.db".to_string() }

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| OverseerError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| OverseerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.recovery.strategies.is_empty() {
            return Err(OverseerError::Config(
                "recovery.strategies must list at least one strategy".into(),
            ));
        }
        if self.circuit_breaker.threshold == 0 {
            return Err(OverseerError::Config(
                "circuit_breaker.threshold must be at least 1".into(),
            ));
        }
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(OverseerError::Config(format!(
                    "log.level must be 1, 2 or 3 (got {})",
                    log.level
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${VAR}` references using the process environment.
/// Unknown variables are left as-is.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}
