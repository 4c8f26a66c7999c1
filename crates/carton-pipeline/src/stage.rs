//! Shared stage plumbing.

use carton_core::{PipelineSpec, StageKind};
use resource_store::{ResourceStore, RetryPolicy};
use serde::Serialize;

use crate::http::ArtifactFetcher;
use crate::runner::CommandRunner;
use crate::staging::StagingArea;

/// Everything a stage driver may touch during one run.
pub struct StageContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub artifacts: &'a dyn ArtifactFetcher,
    pub store: &'a dyn ResourceStore,
    pub retry: &'a RetryPolicy,
    pub spec: &'a PipelineSpec,
    pub staging: &'a StagingArea,
}

/// A stage that completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub kind: StageKind,
    pub index: usize,
    pub driver: String,
    pub duration_ms: u64,
    /// Short description of what the stage produced.
    pub output: String,
}
