use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverseerError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Graph errors
    #[error("No start node defined in workflow graph")]
    MissingStartNode,

    #[error("Node not found in graph: {0}")]
    UnknownNode(String),

    #[error("No step registered for node: {0}")]
    UnknownStep(String),

    #[error("Unknown guard condition '{guard}' on edge {from} -> {to}")]
    UnknownGuard {
        guard: String,
        from: String,
        to: String,
    },

    // Step errors
    #[error("Step failed: {step}: {message}")]
    Step { step: String, message: String },

    #[error("Step timeout after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Workflow cancelled")]
    Cancelled,

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OverseerError {
    /// Shorthand for a step failure.
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a configuration problem that must not be retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigNotFound(_)
                | Self::MissingStartNode
                | Self::UnknownNode(_)
                | Self::UnknownStep(_)
                | Self::UnknownGuard { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OverseerError>;
