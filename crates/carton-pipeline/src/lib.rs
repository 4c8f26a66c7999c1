//! Carton pipeline executor.
//!
//! Runs a synthesized `PipelineSpec`: fetch sources into a staging area,
//! pipe the manifest stream through template steps and hand the result to
//! the deploy step. External tools sit behind the `CommandRunner` and
//! `ArtifactFetcher` seams.

pub mod cancel;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod fetch;
pub mod http;
pub mod runner;
pub mod stage;
pub mod staging;
pub mod template;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use deploy::{delete_placeholder_secrets, DeployOutput, SERVICE_ACCOUNT_ENV};
pub use error::PipelineError;
pub use executor::{ExecutorConfig, PipelineExecutor, RunError, RunReport, StagingMode};
pub use fetch::{placeholder_secret_name, PLACEHOLDER_LABEL};
pub use http::{ArtifactFetcher, HttpArtifactFetcher};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use stage::StageRecord;
pub use staging::StagingArea;
