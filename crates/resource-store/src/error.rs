//! Error types for resource-store

use thiserror::Error;

/// Errors returned by a [`ResourceStore`](crate::ResourceStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No object under the given key.
    #[error("resource not found: {key}")]
    NotFound { key: String },

    /// `create` on a key that is already taken.
    #[error("resource already exists: {key}")]
    AlreadyExists { key: String },

    /// Optimistic write raced with another writer.
    #[error("write conflict on {key}: expected resourceVersion {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The store could not be reached or is temporarily unhealthy.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The request was rejected by validation.
    #[error("invalid resource: {0}")]
    Invalid(String),

    /// Serialization or deserialization failed.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    /// Whether this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
