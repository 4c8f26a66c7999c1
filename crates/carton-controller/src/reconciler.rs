//! One reconcile pass over a single InstallRequest or App.
//!
//! A pass reads the record, resolves and synthesizes its pipeline, runs it
//! and writes the outcome back as conditions. Deleting records get their
//! cleanup pass instead. Every status write is a read-modify-write against
//! the freshest copy of the record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use carton_core::obs::{
    emit_cleanup_finished, emit_reconcile_failed, emit_reconcile_skipped,
    emit_reconcile_started, emit_reconcile_succeeded, ReconcileSpan,
};
use carton_core::{
    synthesize_app, synthesize_install, AppSpec, CartonError, ControllerConfig,
    InstallRequestSpec, Object, Phase, PipelineSpec, ReconcileStatus, Result, VersionResolver,
    APP_KIND, INSTALL_REQUEST_KIND, METRICS,
};
use carton_pipeline::{CancelToken, PipelineExecutor, RunError};
use chrono::Utc;
use resource_store::{
    retry_transient, update_object_with, update_status_with, ObjectKey, ResourceStore,
    StoredObject,
};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;

/// Attached before the first run so cleanup happens before a record is
/// discarded.
pub const CLEANUP_FINALIZER: &str = "carton.dev/cleanup";

/// Why a pass was started. When several are pending the greatest wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Trigger {
    /// The record or one of its inputs changed.
    Watch,
    /// A failed attempt's backoff expired.
    Retry,
    /// The sync period expired.
    Resync,
    /// Requested directly, e.g. at startup or by the local harness.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { resync: Option<Duration> },
    /// Nothing changed since the last successful run.
    Skipped { resync: Option<Duration> },
    Failed { retry_in: Duration },
    /// A permanent error; waits for the record or its package to change.
    Blocked,
    Paused,
    /// The run was abandoned at a stage boundary.
    Cancelled,
    /// Cleanup ran and the finalizer was released.
    Finalized,
    /// The record no longer exists.
    Gone,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Finalized | Outcome::Gone)
    }

    /// When the next pass should start on its own, and as what.
    pub fn requeue(&self) -> Option<(Duration, Trigger)> {
        match self {
            Outcome::Succeeded { resync } | Outcome::Skipped { resync } => {
                resync.map(|period| (period, Trigger::Resync))
            }
            Outcome::Failed { retry_in } => Some((*retry_in, Trigger::Retry)),
            Outcome::Cancelled => Some((Duration::ZERO, Trigger::Explicit)),
            Outcome::Blocked | Outcome::Paused | Outcome::Finalized | Outcome::Gone => None,
        }
    }
}

enum Source {
    Install(Object<InstallRequestSpec>),
    App(Object<AppSpec>),
}

struct Record {
    paused: bool,
    sync_period: Option<String>,
    source: Source,
}

impl Record {
    fn decode(object: StoredObject) -> Result<Self> {
        match object.kind.as_str() {
            INSTALL_REQUEST_KIND => {
                let install = Object::<InstallRequestSpec>::from_stored(object)?;
                Ok(Self {
                    paused: install.spec.paused,
                    sync_period: install.spec.sync_period.clone(),
                    source: Source::Install(install),
                })
            }
            APP_KIND => {
                let app = Object::<AppSpec>::from_stored(object)?;
                Ok(Self {
                    paused: app.spec.paused,
                    sync_period: app.spec.sync_period.clone(),
                    source: Source::App(app),
                })
            }
            other => Err(CartonError::InvalidSpec(format!(
                "kind {other} is not reconciled"
            ))),
        }
    }
}

/// Status of a stored record; a missing or unreadable status reads as empty.
pub fn record_status(object: &StoredObject) -> ReconcileStatus {
    serde_json::from_value(object.status.clone()).unwrap_or_default()
}

pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    resolver: VersionResolver,
    executor: PipelineExecutor,
    config: ControllerConfig,
    backoff: Backoff,
    local_fetch: bool,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        resolver: VersionResolver,
        executor: PipelineExecutor,
        config: ControllerConfig,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            store,
            resolver,
            executor,
            config,
            backoff,
            local_fetch: false,
        }
    }

    /// Honor `carton.dev/local-fetch-N` annotations on records.
    pub fn with_local_fetch(mut self, enabled: bool) -> Self {
        self.local_fetch = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run one pass for `key`.
    ///
    /// `Err` is returned only for store failures that outlived the retry
    /// budget; every other problem ends up in the record's conditions.
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        trigger: Trigger,
        cancel: &CancelToken,
    ) -> Result<Outcome> {
        ReconcileSpan::new(&key.kind, &key.namespace, &key.name)
            .instrument(self.pass(key, trigger, cancel))
            .await
    }

    async fn pass(&self, key: &ObjectKey, trigger: Trigger, cancel: &CancelToken) -> Result<Outcome> {
        let retry = &self.config.store_retry;
        let object = match retry_transient(retry, "get-record", || self.store.get(key)).await {
            Ok(object) => object,
            Err(err) if err.is_not_found() => {
                debug!(key = %key, "record gone");
                return Ok(Outcome::Gone);
            }
            Err(err) => return Err(err.into()),
        };

        if object.is_deleting() {
            return self.finalize(object).await;
        }
        if !object.has_finalizer(CLEANUP_FINALIZER) {
            update_object_with(self.store.as_ref(), key, retry, |o| {
                if !o.has_finalizer(CLEANUP_FINALIZER) {
                    o.metadata.finalizers.push(CLEANUP_FINALIZER.to_string());
                }
            })
            .await?;
        }

        let generation = object.metadata.generation;
        let status = record_status(&object);
        let record = match Record::decode(object) {
            Ok(record) => record,
            Err(err) => return self.block(key, generation, &status, &err).await,
        };

        if record.paused {
            if status.friendly_description != "Paused" || status.observed_generation != generation {
                self.write_status(key, |s| s.mark_paused(generation)).await?;
            }
            info!(key = %key, "paused; no pipeline run");
            return Ok(Outcome::Paused);
        }

        let sync_period = match self.config.sync_period_for(record.sync_period.as_deref()) {
            Ok(period) => period,
            Err(err) => return self.block(key, generation, &status, &err).await,
        };
        let resync = (!sync_period.is_zero()).then_some(sync_period);

        let (spec, resolved_version) = match self.synthesize(&record.source).await {
            Ok(plan) => plan,
            Err(err) if err.is_permanent() => {
                return self.block(key, generation, &status, &err).await
            }
            Err(err) => {
                return self
                    .fail(key, generation, err.reason(), &err.to_string(), sync_period)
                    .await
            }
        };

        let spec_changed = status.observed_generation != generation;
        if trigger == Trigger::Watch
            && !spec_changed
            && status.phase() == Phase::Succeeded
            && status.last_successful_fingerprint.as_ref() == Some(&spec.fingerprint)
        {
            emit_reconcile_skipped(&key.to_string(), "fingerprint unchanged");
            return Ok(Outcome::Skipped { resync });
        }

        METRICS.inc_reconciles_started();
        emit_reconcile_started(&key.to_string(), spec.fingerprint.short(), generation);
        let limit = self.config.history_limit;
        self.write_status(key, |s| {
            if s.observed_generation != generation {
                s.reset_retries();
            }
            s.begin(
                Utc::now(),
                generation,
                spec.fingerprint.clone(),
                resolved_version.clone(),
                limit,
            );
        })
        .await?;

        let started = Instant::now();
        match self.executor.run(&spec, cancel).await {
            Ok(report) => {
                self.write_status(key, |s| s.succeed(Utc::now(), limit)).await?;
                METRICS.inc_reconciles_succeeded();
                emit_reconcile_succeeded(&key.to_string(), started.elapsed().as_millis() as u64);
                debug!(manifest = %report.deploy.manifest_digest, stages = report.stages.len(), "applied");
                Ok(Outcome::Succeeded { resync })
            }
            Err(RunError::Stage { failure, staging, .. }) => {
                if let Some(staging) = staging.filter(|s| !s.is_temporary()) {
                    info!(path = %staging.root().display(), "partial output kept");
                }
                let err = CartonError::from(failure);
                self.fail(key, generation, err.reason(), &err.to_string(), sync_period)
                    .await
            }
            Err(RunError::Cancelled { completed }) => {
                info!(key = %key, completed = completed.len(), "run abandoned");
                Ok(Outcome::Cancelled)
            }
        }
    }

    async fn synthesize(&self, source: &Source) -> Result<(PipelineSpec, Option<String>)> {
        let (spec, version, annotations) = match source {
            Source::Install(install) => {
                let version = self
                    .resolver
                    .resolve(install.namespace(), &install.spec.package_ref)
                    .await?;
                let spec = synthesize_install(&version, install)?;
                let resolved = version.spec.version.clone();
                (spec, Some(resolved), &install.metadata.annotations)
            }
            Source::App(app) => (synthesize_app(app)?, None, &app.metadata.annotations),
        };
        if self.local_fetch {
            return Ok((spec.with_local_fetch(annotations)?, version));
        }
        Ok((spec, version))
    }

    /// Record a retryable failure and schedule the next attempt. A failure
    /// of a new generation starts counting retries from zero.
    async fn fail(
        &self,
        key: &ObjectKey,
        generation: u64,
        reason: &str,
        message: &str,
        sync_period: Duration,
    ) -> Result<Outcome> {
        let backoff = self.backoff;
        let limit = self.config.history_limit;
        let mut retry_in = Duration::ZERO;
        let status = self
            .write_status(key, |s| {
                if s.observed_generation != generation {
                    s.reset_retries();
                    s.observed_generation = generation;
                }
                retry_in = backoff.delay(s.retry_count.saturating_add(1), sync_period);
                let now = Utc::now();
                let next = chrono::Duration::from_std(retry_in)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d));
                s.fail(now, reason, message, next, limit);
            })
            .await?;
        METRICS.inc_reconciles_failed();
        emit_reconcile_failed(&key.to_string(), reason, status.retry_count, &message);
        Ok(Outcome::Failed { retry_in })
    }

    /// Record a permanent error once; later passes over the same
    /// generation leave the status untouched.
    async fn block(
        &self,
        key: &ObjectKey,
        generation: u64,
        current: &ReconcileStatus,
        err: &CartonError,
    ) -> Result<Outcome> {
        let reason = err.reason();
        let message = err.to_string();
        if current.observed_generation == generation && current.already_reports(reason, &message) {
            debug!(key = %key, reason, "permanent error already reported");
            return Ok(Outcome::Blocked);
        }
        let limit = self.config.history_limit;
        let status = self
            .write_status(key, |s| {
                s.fail_permanently(Utc::now(), generation, reason, &message, limit)
            })
            .await?;
        METRICS.inc_reconciles_failed();
        emit_reconcile_failed(&key.to_string(), reason, status.retry_count, &message);
        Ok(Outcome::Blocked)
    }

    /// Cleanup pass for a deleting record, then release the finalizer.
    async fn finalize(&self, object: StoredObject) -> Result<Outcome> {
        let key = object.key();
        if !object.has_finalizer(CLEANUP_FINALIZER) {
            debug!(key = %key, "deletion pending other finalizers");
            return Ok(Outcome::Gone);
        }
        self.cleanup_object(object).await;
        let released = update_object_with(self.store.as_ref(), &key, &self.config.store_retry, |o| {
            o.metadata.finalizers.retain(|f| f != CLEANUP_FINALIZER)
        })
        .await;
        match released {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        info!(key = %key, "finalized");
        Ok(Outcome::Finalized)
    }

    /// Run the cleanup path for `key` without deleting the record.
    ///
    /// Returns whether every cleanup step succeeded.
    pub async fn cleanup(&self, key: &ObjectKey) -> Result<bool> {
        let object =
            retry_transient(&self.config.store_retry, "get-record", || self.store.get(key)).await?;
        Ok(self.cleanup_object(object).await)
    }

    /// Best-effort removal of everything a record deployed.
    async fn cleanup_object(&self, object: StoredObject) -> bool {
        let key = object.key();
        let spec = match Record::decode(object) {
            Ok(record) => self.synthesize(&record.source).await.map(|(spec, _)| spec),
            Err(err) => Err(err),
        };
        let result = match spec {
            Ok(spec) => self.executor.cleanup(&spec).await,
            Err(err) => {
                warn!(key = %key, error = %err, "pipeline unavailable; removing placeholder credentials only");
                self.executor
                    .cleanup_placeholders(&key.namespace, &key.name)
                    .await
            }
        };
        let ok = match result {
            Ok(()) => true,
            Err(failure) => {
                warn!(key = %key, error = %failure, "cleanup incomplete");
                false
            }
        };
        emit_cleanup_finished(&key.to_string(), ok);
        ok
    }

    async fn write_status<F>(&self, key: &ObjectKey, mut apply: F) -> Result<ReconcileStatus>
    where
        F: FnMut(&mut ReconcileStatus),
    {
        let mut encode_error = None;
        let updated = update_status_with(self.store.as_ref(), key, &self.config.store_retry, |object| {
            let mut status = record_status(object);
            apply(&mut status);
            match serde_json::to_value(&status) {
                Ok(value) => object.status = value,
                Err(err) => encode_error = Some(err),
            }
        })
        .await?;
        if let Some(err) = encode_error {
            return Err(err.into());
        }
        Ok(record_status(&updated))
    }
}
