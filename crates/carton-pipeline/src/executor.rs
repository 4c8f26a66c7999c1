//! Pipeline execution.
//!
//! Stages run strictly in order: every fetch source, every template step,
//! then the single deploy step. The first failure aborts the run; output of
//! completed stages stays in the staging area and is never applied.
//! Cancellation is honoured between stages and the whole run is bounded by
//! `ExecutorConfig::run_timeout`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use carton_core::obs::emit_stage_finished;
use carton_core::{PipelineSpec, StageFailure, StageKind, METRICS};
use resource_store::{ResourceStore, RetryPolicy};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::deploy::{self, DeployOutput};
use crate::error::PipelineError;
use crate::fetch::{run_fetch, FetchOutput};
use crate::http::ArtifactFetcher;
use crate::runner::CommandRunner;
use crate::stage::{StageContext, StageRecord};
use crate::staging::{collect_yaml_files, concat_yaml, StagingArea};
use crate::template::run_template;

/// Where a run's scratch files live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StagingMode {
    /// A temporary directory, removed with the report.
    #[default]
    Temporary,
    /// A fixed directory kept for inspection.
    Persistent(PathBuf),
}

impl StagingMode {
    fn open(&self) -> std::io::Result<StagingArea> {
        match self {
            StagingMode::Temporary => StagingArea::temporary(),
            StagingMode::Persistent(root) => StagingArea::persistent(root),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub run_timeout: Duration,
    pub staging: StagingMode,
    pub store_retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(10 * 60),
            staging: StagingMode::Temporary,
            store_retry: RetryPolicy::default(),
        }
    }
}

/// Result of a successful run.
#[derive(Debug)]
pub struct RunReport {
    /// Bytes handed to the deploy stage.
    pub manifest: Vec<u8>,
    pub deploy: DeployOutput,
    pub stages: Vec<StageRecord>,
    pub duration_ms: u64,
    pub staging: StagingArea,
}

/// Why a run did not complete.
#[derive(Debug)]
pub enum RunError {
    Stage {
        failure: StageFailure,
        completed: Vec<StageRecord>,
        /// Kept for inspection of partial output.
        staging: Option<StagingArea>,
    },
    Cancelled {
        completed: Vec<StageRecord>,
    },
}

impl RunError {
    pub fn stage_failure(&self) -> Option<&StageFailure> {
        match self {
            RunError::Stage { failure, .. } => Some(failure),
            RunError::Cancelled { .. } => None,
        }
    }
}

enum Interrupt {
    Failed(StageFailure),
    Cancelled,
}

/// Runs pipeline specs against external tools and the resource store.
#[derive(Clone)]
pub struct PipelineExecutor {
    runner: Arc<dyn CommandRunner>,
    artifacts: Arc<dyn ArtifactFetcher>,
    store: Arc<dyn ResourceStore>,
    config: ExecutorConfig,
}

impl PipelineExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        artifacts: Arc<dyn ArtifactFetcher>,
        store: Arc<dyn ResourceStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            runner,
            artifacts,
            store,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute every stage of `spec`.
    pub async fn run(&self, spec: &PipelineSpec, cancel: &CancelToken) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.run_timeout;
        let mut completed = Vec::new();

        let staging = match self.config.staging.open() {
            Ok(staging) => staging,
            Err(e) => {
                return Err(RunError::Stage {
                    failure: StageFailure::new(StageKind::Fetch, 0, "staging", e.to_string()),
                    completed,
                    staging: None,
                })
            }
        };
        debug!(staging = %staging.root().display(), fingerprint = %spec.fingerprint.short(), "pipeline run starting");

        match self
            .execute(spec, cancel, &staging, deadline, &mut completed)
            .await
        {
            Ok((manifest, deploy)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(app = %spec.app_name, stages = completed.len(), duration_ms, "pipeline run succeeded");
                Ok(RunReport {
                    manifest,
                    deploy,
                    stages: completed,
                    duration_ms,
                    staging,
                })
            }
            Err(Interrupt::Failed(failure)) => Err(RunError::Stage {
                failure,
                completed,
                staging: Some(staging),
            }),
            Err(Interrupt::Cancelled) => {
                info!(app = %spec.app_name, completed = completed.len(), "pipeline run cancelled");
                Err(RunError::Cancelled { completed })
            }
        }
    }

    async fn execute(
        &self,
        spec: &PipelineSpec,
        cancel: &CancelToken,
        staging: &StagingArea,
        deadline: tokio::time::Instant,
        completed: &mut Vec<StageRecord>,
    ) -> Result<(Vec<u8>, DeployOutput), Interrupt> {
        let ctx = StageContext {
            runner: self.runner.as_ref(),
            artifacts: self.artifacts.as_ref(),
            store: self.store.as_ref(),
            retry: &self.config.store_retry,
            spec,
            staging,
        };

        let mut fetch_dirs = Vec::with_capacity(spec.fetch.len());
        for (index, source) in spec.fetch.iter().enumerate() {
            check_cancel(cancel)?;
            let work = run_fetch(&ctx, index, source);
            let out = self
                .stage(StageKind::Fetch, index, source.driver_name(), deadline, completed, work)
                .await?;
            fetch_dirs.push(out.dir);
        }

        let mut stream = initial_stream(&fetch_dirs).map_err(|e| {
            Interrupt::Failed(StageFailure::new(StageKind::Template, 0, "staging", e.to_string()))
        })?;

        for (index, step) in spec.template.iter().enumerate() {
            check_cancel(cancel)?;
            let work = run_template(&ctx, index, step, stream);
            stream = self
                .stage(StageKind::Template, index, step.driver_name(), deadline, completed, work)
                .await?;
        }

        check_cancel(cancel)?;
        let work = deploy::run_deploy(&ctx, &stream);
        let deploy = self
            .stage(StageKind::Deploy, 0, spec.deploy.driver_name(), deadline, completed, work)
            .await?;

        Ok((stream, deploy))
    }

    async fn stage<T, F>(
        &self,
        kind: StageKind,
        index: usize,
        driver: &str,
        deadline: tokio::time::Instant,
        completed: &mut Vec<StageRecord>,
        work: F,
    ) -> Result<T, Interrupt>
    where
        T: Describe,
        F: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        METRICS.inc_stage_runs();
        let outcome = tokio::time::timeout_at(deadline, work).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                emit_stage_finished(&kind.to_string(), index, driver, duration_ms, true);
                completed.push(StageRecord {
                    kind,
                    index,
                    driver: driver.to_string(),
                    duration_ms,
                    output: value.describe(),
                });
                Ok(value)
            }
            Ok(Err(err)) => {
                emit_stage_finished(&kind.to_string(), index, driver, duration_ms, false);
                Err(Interrupt::Failed(StageFailure::new(
                    kind,
                    index,
                    driver,
                    err.to_string(),
                )))
            }
            Err(_) => {
                emit_stage_finished(&kind.to_string(), index, driver, duration_ms, false);
                Err(Interrupt::Failed(StageFailure::timeout(
                    kind,
                    index,
                    driver,
                    self.config.run_timeout.as_secs(),
                )))
            }
        }
    }

    /// Undo a deployment: delete applied resources, then placeholder
    /// credentials.
    ///
    /// Both steps always run; the first failure is returned.
    pub async fn cleanup(&self, spec: &PipelineSpec) -> Result<(), StageFailure> {
        let driver = spec.deploy.driver_name();
        let deleted =
            match tokio::time::timeout(self.config.run_timeout, deploy::run_delete(self.runner.as_ref(), spec)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(StageFailure::new(StageKind::Deploy, 0, driver, err.to_string())),
                Err(_) => Err(StageFailure::timeout(
                    StageKind::Deploy,
                    0,
                    driver,
                    self.config.run_timeout.as_secs(),
                )),
            };
        if let Err(failure) = &deleted {
            warn!(app = %spec.app_name, error = %failure, "delete failed; still removing placeholder credentials");
        }
        let placeholders = self.cleanup_placeholders(&spec.namespace, &spec.app_name).await;
        deleted.and(placeholders)
    }

    /// Delete placeholder credentials only; used when no pipeline was ever
    /// synthesized for the record.
    pub async fn cleanup_placeholders(&self, namespace: &str, app_name: &str) -> Result<(), StageFailure> {
        deploy::delete_placeholder_secrets(self.store.as_ref(), namespace, app_name, &self.config.store_retry)
            .await
            .map(|_| ())
            .map_err(|err| StageFailure::new(StageKind::Fetch, 0, "placeholder", err.to_string()))
    }
}

/// One-line summary of a stage's output for the run record.
trait Describe {
    fn describe(&self) -> String;
}

impl Describe for FetchOutput {
    fn describe(&self) -> String {
        format!("{} files", self.files)
    }
}

impl Describe for Vec<u8> {
    fn describe(&self) -> String {
        format!("{} bytes", self.len())
    }
}

impl Describe for DeployOutput {
    fn describe(&self) -> String {
        let digest = &self.manifest_digest;
        format!("manifest {}", &digest[..digest.len().min(12)])
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<(), Interrupt> {
    if cancel.is_cancelled() {
        Err(Interrupt::Cancelled)
    } else {
        Ok(())
    }
}

/// YAML from every fetch directory, in stage order then path order.
fn initial_stream(fetch_dirs: &[PathBuf]) -> std::io::Result<Vec<u8>> {
    let mut stream = Vec::new();
    for dir in fetch_dirs {
        stream.extend(concat_yaml(&collect_yaml_files(dir)?)?);
    }
    Ok(stream)
}
