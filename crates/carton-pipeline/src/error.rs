//! Driver-level errors raised inside the executor.
//!
//! The executor wraps every one of these into a `StageFailure`; the text
//! produced by `Display` becomes the condition message verbatim.

use carton_core::CartonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("download {url}: {message}")]
    Http { url: String, message: String },

    #[error("invalid stage input: {0}")]
    InvalidInput(String),

    #[error("staging I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Domain(#[from] CartonError),
}

impl From<resource_store::StorageError> for PipelineError {
    fn from(err: resource_store::StorageError) -> Self {
        PipelineError::Domain(err.into())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Domain(err.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
