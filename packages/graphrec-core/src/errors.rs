//! Error types for graphrec-core
//!
//! Expected conditions (busy lease, duplicate event, cache miss, discarded
//! notification) are outcome values, not errors.

use graphrec_storage::{ErrorKind, StorageError};
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Store stayed unreachable after retries (or deadline expiry)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Input rejected before touching any store
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic write kept losing races
    #[error("Conflict on {entity_id} after {attempts} attempts")]
    Conflict { entity_id: String, attempts: u32 },

    /// Index could not be brought in line with the graph
    #[error("Permanent desync for {entity_id}: {reason}")]
    PermanentDesync { entity_id: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-transient store failure
    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    /// Worth retrying later (the event / chunk is not poisoned)
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Unavailable(_) | CoreError::Conflict { .. } => true,
            CoreError::Storage(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err.kind {
            ErrorKind::Unavailable | ErrorKind::Timeout => CoreError::Unavailable(err.to_string()),
            ErrorKind::NotFound => CoreError::NotFound(err.message),
            _ => CoreError::Storage(err),
        }
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        let err: CoreError = StorageError::timeout("graph call exceeded 2s").into();
        assert!(matches!(err, CoreError::Unavailable(_)));
        assert!(err.is_transient());

        let err: CoreError = StorageError::not_found("entity u1").into();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(!err.is_transient());

        let err: CoreError = StorageError::serialization("bad row").into();
        assert!(matches!(err, CoreError::Storage(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_conflict_display() {
        let err = CoreError::Conflict {
            entity_id: "u42".to_string(),
            attempts: 8,
        };
        assert_eq!(err.to_string(), "Conflict on u42 after 8 attempts");
    }
}
