//! Error types for pubflow.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::WorkflowStep;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The persisted document could not be parsed or violates an invariant.
    /// Fatal: the whole operation aborts and the file is left untouched.
    #[error("corrupt state at {path:?}: {message}")]
    CorruptState { path: PathBuf, message: String },

    /// An executor reported failure for a step.
    #[error("step {step} failed for {entity_id} (attempt {attempts}): {message}")]
    StepExecution {
        entity_id: String,
        step: WorkflowStep,
        attempts: u32,
        message: String,
    },

    /// Retry was requested for a step whose attempts are exhausted.
    #[error("retry limit exceeded for {entity_id} at {step}: {attempts}/{max} attempts used")]
    RetryLimitExceeded {
        entity_id: String,
        step: WorkflowStep,
        attempts: u32,
        max: u32,
    },

    /// The requested operation is not legal from the current state.
    #[error("invalid transition for {entity_id} at {step}: {message}")]
    InvalidTransition {
        entity_id: String,
        step: String,
        message: String,
    },

    /// A step was found `running` with no live owner.
    #[error(
        "step {step} is stuck in running for {entity_id} (attempt {attempts}); resolve with complete or fail"
    )]
    StuckStep {
        entity_id: String,
        step: WorkflowStep,
        attempts: u32,
    },

    /// The referenced entity id is not tracked.
    #[error("entity not found: {entity_id}")]
    NotFound { entity_id: String },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Executor subprocess spawn or protocol failure.
    #[error("executor error: {0}")]
    Executor(String),

    /// JSON encoding error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a corrupt-state error for the document at `path`.
    pub fn corrupt(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::CorruptState {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid-transition error.
    pub fn invalid_transition(
        entity_id: impl Into<String>,
        step: impl ToString,
        msg: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            entity_id: entity_id.into(),
            step: step.to_string(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for an entity id.
    pub fn not_found(entity_id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_id: entity_id.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort the whole run rather than a single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptState { .. } | Self::Io { .. })
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
