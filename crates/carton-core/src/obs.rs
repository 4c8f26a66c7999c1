//! Structured lifecycle events for reconcile passes and pipeline stages.
//!
//! Every event carries an `event` field (`reconcile.started`,
//! `stage.finished`, ...) so log pipelines can filter on it.

use tracing::{info, warn, Instrument};

/// Span tagging every log line of one reconcile pass with the record.
///
/// The instrumented future stays `Send`.
///
/// ```ignore
/// ReconcileSpan::new("InstallRequest", "default", "demo")
///     .instrument(reconciler.pass(&key))
///     .await
/// ```
pub struct ReconcileSpan {
    span: tracing::Span,
}

impl ReconcileSpan {
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            span: tracing::info_span!("carton.reconcile", kind = %kind, namespace = %namespace, name = %name),
        }
    }

    pub fn instrument<F: std::future::Future>(self, future: F) -> tracing::instrument::Instrumented<F> {
        future.instrument(self.span)
    }
}

pub fn emit_reconcile_started(key: &str, fingerprint: &str, generation: u64) {
    info!(event = "reconcile.started", key = %key, fingerprint = %fingerprint, generation);
}

pub fn emit_reconcile_succeeded(key: &str, duration_ms: u64) {
    info!(event = "reconcile.succeeded", key = %key, duration_ms);
}

pub fn emit_reconcile_failed(key: &str, reason: &str, retry_count: u32, error: &dyn std::fmt::Display) {
    warn!(event = "reconcile.failed", key = %key, reason = %reason, retry_count, error = %error);
}

pub fn emit_reconcile_skipped(key: &str, why: &str) {
    info!(event = "reconcile.skipped", key = %key, why = %why);
}

pub fn emit_stage_finished(stage: &str, index: usize, driver: &str, duration_ms: u64, success: bool) {
    info!(
        event = "stage.finished",
        stage = %stage,
        index,
        driver = %driver,
        duration_ms,
        success,
    );
}

pub fn emit_cleanup_finished(key: &str, success: bool) {
    info!(event = "cleanup.finished", key = %key, success);
}
