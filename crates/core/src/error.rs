//! Engine error model.

use thiserror::Error;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure reported by a storage backend while reading or flushing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// An optimistic compare-and-set on a row revision failed.
    #[error("concurrent modification of {kind} '{id}'")]
    ConcurrentModification { kind: String, id: String },

    /// The backend aborted the transaction because it could not be serialized.
    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    /// An insert collided with an existing row.
    #[error("duplicate key {kind} '{id}'")]
    DuplicateKey { kind: String, id: String },

    /// A backend-specific error, identified by its error code (e.g. SQLSTATE).
    #[error("backend error [{code}]: {message}")]
    Backend { code: String, message: String },

    /// The backend could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn concurrent_modification(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ConcurrentModification {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn backend(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Engine-level error.
///
/// - `Validation` / `NotFound` are caller errors, surfaced synchronously.
/// - `Job` carries a business failure raised by a job handler.
/// - `Storage`, `TransientRetriesExhausted` and `Internal` are infrastructure failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad command arguments.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A retryable command kept failing with transient conflicts.
    #[error("command '{command}' still conflicting after {attempts} attempts")]
    TransientRetriesExhausted {
        command: String,
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    /// The executing owner no longer holds the lock of a job.
    #[error("lock on job '{0}' is no longer held")]
    LockLost(String),

    /// Failure raised by application code running inside a job.
    #[error("job failed: {0}")]
    Job(#[from] anyhow::Error),

    /// A row could not be converted to or from its entity type.
    #[error("entity codec error: {0}")]
    Codec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The storage error behind this failure, if any.
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            EngineError::Storage(err) => Some(err),
            _ => None,
        }
    }

    /// True for failures of the engine's own machinery rather than of the
    /// caller's input or the application's job code.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            EngineError::Storage(_)
            | EngineError::TransientRetriesExhausted { .. }
            | EngineError::Codec(_)
            | EngineError::Internal(_) => true,
            EngineError::Validation(_)
            | EngineError::NotFound { .. }
            | EngineError::LockLost(_)
            | EngineError::Job(_) => false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        EngineError::Codec(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_infrastructure() {
        let err: EngineError = StorageError::Unavailable("down".into()).into();
        assert!(err.is_infrastructure());
        assert!(err.storage_error().is_some());
    }

    #[test]
    fn job_failures_are_business_errors() {
        let err: EngineError = anyhow::anyhow!("invoice rejected").into();
        assert!(!err.is_infrastructure());
        assert_eq!(err.to_string(), "job failed: invoice rejected");
    }

    #[test]
    fn exhausted_retries_keep_the_last_cause() {
        let err = EngineError::TransientRetriesExhausted {
            command: "ExecuteJobCmd".into(),
            attempts: 4,
            source: Box::new(StorageError::SerializationFailure("40001".into()).into()),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("serialization failure: 40001"));
    }
}
