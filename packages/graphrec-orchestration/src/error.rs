use graphrec_core::config::ConfigError;
use graphrec_core::CoreError;
use graphrec_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Chunk failed: {0}")]
    ChunkFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn chunk_failed<E: std::fmt::Display>(e: E) -> Self {
        Self::ChunkFailed(e.to_string())
    }

    /// How the scheduler should treat this failure
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Core(err) if err.is_transient() => ErrorCategory::Transient,
            OrchestratorError::Storage(err) if err.is_transient() => ErrorCategory::Transient,
            OrchestratorError::Core(CoreError::Storage(_))
            | OrchestratorError::Storage(_)
            | OrchestratorError::Io(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Retry on the next trigger (store outage, timeout)
    Transient,
    /// Retrying will not help (invalid input, unknown job)
    Permanent,
    /// Needs an operator (store corruption, disk)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
