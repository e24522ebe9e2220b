//! Classification of transient storage failures.

use procengine_core::{EngineError, StorageError};

/// Decides whether a failed command may be retried in a fresh transaction.
pub trait TransientErrorClassifier: Send + Sync + core::fmt::Debug {
    fn is_transient(&self, error: &EngineError) -> bool;
}

/// Classifies by backend error code (SQLSTATE style).
///
/// Serialization failures are always transient; `Backend` errors are
/// transient when their code is in `codes`. Optimistic-locking failures are
/// only transient when `retry_on_optimistic_locking` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStateClassifier {
    pub codes: Vec<String>,
    pub retry_on_optimistic_locking: bool,
}

impl Default for SqlStateClassifier {
    fn default() -> Self {
        Self {
            codes: vec!["40001".to_string()],
            retry_on_optimistic_locking: false,
        }
    }
}

impl SqlStateClassifier {
    pub fn new(codes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_optimistic_locking_retries(mut self, enabled: bool) -> Self {
        self.retry_on_optimistic_locking = enabled;
        self
    }
}

impl TransientErrorClassifier for SqlStateClassifier {
    fn is_transient(&self, error: &EngineError) -> bool {
        match error.storage_error() {
            Some(StorageError::SerializationFailure(_)) => true,
            Some(StorageError::Backend { code, .. }) => self.codes.iter().any(|c| c == code),
            Some(StorageError::ConcurrentModification { .. }) => self.retry_on_optimistic_locking,
            Some(StorageError::DuplicateKey { .. } | StorageError::Unavailable(_)) | None => false,
        }
    }
}
