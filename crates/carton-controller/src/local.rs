//! Local simulation harness.
//!
//! Loads documents into an in-memory store and reconciles every
//! InstallRequest and App once, in document order, while a tailer streams
//! condition transitions. Delete mode runs only the cleanup path.

use std::future::Future;
use std::sync::Arc;

use carton_core::{
    CartonError, ControllerConfig, Documents, Phase, Result, VersionResolver, APP_KIND,
    INSTALL_REQUEST_KIND,
};
use carton_pipeline::{
    ArtifactFetcher, CancelToken, CommandRunner, ExecutorConfig, PipelineExecutor, StagingMode,
};
use resource_store::{retry_transient, MemoryResourceStore, ObjectKey, ResourceStore, StoredObject};
use tracing::{debug, info};

use crate::controller::Controller;
use crate::reconciler::{record_status, Reconciler, Trigger};
use crate::tailer::spawn_tailer;

#[derive(Debug, Clone)]
pub struct LocalOptions {
    /// Run only the cleanup path.
    pub delete: bool,
    /// Replace annotated fetch sources with local directories.
    pub local_fetch: bool,
    pub staging: StagingMode,
    pub config: ControllerConfig,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            delete: false,
            local_fetch: false,
            staging: StagingMode::Temporary,
            config: ControllerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReport {
    pub key: ObjectKey,
    pub phase: Phase,
    /// Failure message, empty on success.
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct LocalReport {
    /// One entry per record, in processing order.
    pub records: Vec<RecordReport>,
    /// Every condition transition the tailer printed.
    pub transitions: Vec<String>,
}

impl LocalReport {
    /// Whether the last record processed ended in `Succeeded`.
    pub fn succeeded(&self) -> bool {
        self.records
            .last()
            .map_or(false, |record| record.phase == Phase::Succeeded)
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

pub struct LocalHarness {
    store: Arc<MemoryResourceStore>,
    reconciler: Arc<Reconciler>,
    records: Vec<ObjectKey>,
    delete: bool,
}

impl LocalHarness {
    pub async fn new(
        documents: &Documents,
        runner: Arc<dyn CommandRunner>,
        artifacts: Arc<dyn ArtifactFetcher>,
        options: LocalOptions,
    ) -> Result<Self> {
        let records: Vec<ObjectKey> = documents
            .iter()
            .filter(|o| o.kind == INSTALL_REQUEST_KIND || o.kind == APP_KIND)
            .map(StoredObject::key)
            .collect();
        if records.is_empty() {
            return Err(CartonError::InvalidSpec(format!(
                "no {INSTALL_REQUEST_KIND} or {APP_KIND} documents given"
            )));
        }

        let store = Arc::new(MemoryResourceStore::new());
        documents
            .load_into(store.as_ref(), &options.config.store_retry)
            .await?;
        info!(documents = documents.len(), records = records.len(), "documents loaded");

        let shared: Arc<dyn ResourceStore> = store.clone();
        let executor = PipelineExecutor::new(
            runner,
            artifacts,
            shared.clone(),
            ExecutorConfig {
                run_timeout: options.config.run_timeout,
                staging: options.staging.clone(),
                store_retry: options.config.store_retry.clone(),
            },
        );
        let resolver = VersionResolver::new(shared.clone())
            .with_retry_policy(options.config.store_retry.clone())
            .with_cache();
        let reconciler = Arc::new(
            Reconciler::new(shared, resolver, executor, options.config)
                .with_local_fetch(options.local_fetch),
        );

        Ok(Self {
            store,
            reconciler,
            records,
            delete: options.delete,
        })
    }

    pub fn store(&self) -> &Arc<MemoryResourceStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn records(&self) -> &[ObjectKey] {
        &self.records
    }

    /// One pass per record (cleanup only in delete mode). Transitions are
    /// passed to `sink` as they happen.
    pub async fn run(&self, sink: impl Fn(&str) + Send + Sync + 'static) -> Result<LocalReport> {
        let tailer = spawn_tailer(self.store.as_ref(), None, sink);
        let mut records = Vec::with_capacity(self.records.len());
        let result = self.passes(&mut records).await;
        let transitions = tailer.stop().await;
        result?;
        Ok(LocalReport {
            records,
            transitions,
        })
    }

    async fn passes(&self, out: &mut Vec<RecordReport>) -> Result<()> {
        for key in &self.records {
            if self.delete {
                let cleaned = self.reconciler.cleanup(key).await?;
                out.push(RecordReport {
                    key: key.clone(),
                    phase: if cleaned { Phase::Succeeded } else { Phase::Failed },
                    message: if cleaned {
                        String::new()
                    } else {
                        "cleanup incomplete".to_string()
                    },
                });
                continue;
            }
            let outcome = self
                .reconciler
                .reconcile(key, Trigger::Explicit, &CancelToken::never())
                .await?;
            debug!(key = %key, ?outcome, "local pass finished");
            out.push(self.report(key).await?);
        }
        Ok(())
    }

    /// Keep reconciling, re-arming on sync periods and backoff, until
    /// `shutdown` resolves.
    pub async fn watch<S>(
        &self,
        shutdown: S,
        sink: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<LocalReport>
    where
        S: Future<Output = ()>,
    {
        let tailer = spawn_tailer(self.store.as_ref(), None, sink);
        let result = Controller::new(self.reconciler.clone()).run(shutdown).await;
        let transitions = tailer.stop().await;
        result?;

        let mut records = Vec::with_capacity(self.records.len());
        for key in &self.records {
            records.push(self.report(key).await?);
        }
        Ok(LocalReport {
            records,
            transitions,
        })
    }

    async fn report(&self, key: &ObjectKey) -> Result<RecordReport> {
        let retry = &self.reconciler.config().store_retry;
        let (phase, message) = match retry_transient(retry, "get-record", || self.store.get(key)).await {
            Ok(object) => {
                let status = record_status(&object);
                (status.phase(), status.useful_error_message)
            }
            Err(err) if err.is_not_found() => (Phase::Idle, "record deleted".to_string()),
            Err(err) => return Err(err.into()),
        };
        Ok(RecordReport {
            key: key.clone(),
            phase,
            message,
        })
    }
}
