//! Domain-level error taxonomy for Carton.

use std::fmt;

use resource_store::StorageError;
use serde::{Deserialize, Serialize};

/// Pipeline stage kinds, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    Fetch,
    Template,
    Deploy,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageKind::Fetch => "fetch",
            StageKind::Template => "template",
            StageKind::Deploy => "deploy",
        };
        f.write_str(s)
    }
}

/// A pipeline stage returned an error.
///
/// Carries enough context for the condition message to name the failing
/// stage; `message` is the driver's error text, verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{stage_kind} stage {index} ({driver}) failed: {message}")]
#[serde(rename_all = "camelCase")]
pub struct StageFailure {
    pub stage_kind: StageKind,
    pub index: usize,
    /// Driver name, e.g. `imgpkgBundle` or `kapp`.
    pub driver: String,
    pub message: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl StageFailure {
    pub fn new(
        stage_kind: StageKind,
        index: usize,
        driver: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage_kind,
            index,
            driver: driver.into(),
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(stage_kind: StageKind, index: usize, driver: impl Into<String>, budget_secs: u64) -> Self {
        Self {
            stage_kind,
            index,
            driver: driver.into(),
            message: format!("pipeline run exceeded its {budget_secs}s budget"),
            timed_out: true,
        }
    }
}

/// Carton domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CartonError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("no version of package '{package}' satisfies '{constraint}' (available: {available})")]
    NoMatchingVersion {
        package: String,
        constraint: String,
        available: String,
    },

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Stage(#[from] StageFailure),

    #[error("store conflict: {0}")]
    StoreConflict(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CartonError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        CartonError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Condition reason recorded for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            CartonError::NotFound { .. } => "NotFound",
            CartonError::NoMatchingVersion { .. } => "NoMatchingVersion",
            CartonError::InvalidSpec(_) => "InvalidSpec",
            CartonError::Stage(_) => "StageFailure",
            CartonError::StoreConflict(_) => "StoreConflict",
            CartonError::TransientIo(_) => "TransientIO",
            CartonError::Storage(_) => "StorageError",
            CartonError::Serialization(_) | CartonError::Yaml(_) => "InvalidSpec",
            CartonError::Io(_) => "TransientIO",
        }
    }

    /// Permanent errors are surfaced once and not retried on a timer.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CartonError::NotFound { .. }
                | CartonError::NoMatchingVersion { .. }
                | CartonError::InvalidSpec(_)
                | CartonError::Serialization(_)
                | CartonError::Yaml(_)
                | CartonError::Storage(_)
        )
    }
}

impl From<StorageError> for CartonError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { key } => CartonError::NotFound {
                kind: "resource".to_string(),
                name: key,
            },
            StorageError::Conflict { .. } => CartonError::StoreConflict(err.to_string()),
            StorageError::Unavailable(msg) => CartonError::TransientIo(msg),
            StorageError::Serialization(msg) => CartonError::InvalidSpec(msg),
            other => CartonError::Storage(other),
        }
    }
}

/// Result type for Carton domain operations.
pub type Result<T> = std::result::Result<T, CartonError>;
