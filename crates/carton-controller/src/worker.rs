//! Per-record reconcile task.
//!
//! Each record gets one task that waits on whichever comes first: a
//! trigger from the controller, its own requeue timer, or shutdown. A pass
//! is never re-entered; triggers that arrive while one is running collapse
//! into a single follow-up pass.

use std::sync::Arc;

use carton_core::METRICS;
use carton_pipeline::{cancel_pair, CancelHandle, CancelToken};
use resource_store::ObjectKey;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::reconciler::{Outcome, Reconciler, Trigger};

pub struct WorkerHandle {
    key: ObjectKey,
    triggers: mpsc::UnboundedSender<Trigger>,
    abort: CancelHandle,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Ask for a pass. Returns false once the worker has exited.
    pub fn trigger(&self, trigger: Trigger) -> bool {
        self.triggers.send(trigger).is_ok()
    }

    /// Abandon the in-flight run at its next stage boundary. Later runs of
    /// this worker are abandoned too; only the cleanup pass remains.
    pub fn abort_runs(&self) {
        self.abort.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop after the current pass and wait for the task to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.join.await {
            warn!(key = %self.key, error = %err, "worker task failed");
        }
    }
}

/// Spawn the worker for `key`; its first pass starts immediately.
pub fn spawn_worker(reconciler: Arc<Reconciler>, key: ObjectKey, initial: Trigger) -> WorkerHandle {
    let (triggers, rx) = mpsc::unbounded_channel();
    let (abort, token) = cancel_pair();
    let (stop, stop_rx) = watch::channel(false);
    let join = tokio::spawn(run_worker(reconciler, key.clone(), initial, rx, token, stop_rx));
    WorkerHandle {
        key,
        triggers,
        abort,
        stop,
        join,
    }
}

async fn run_worker(
    reconciler: Arc<Reconciler>,
    key: ObjectKey,
    mut trigger: Trigger,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    abort: CancelToken,
    mut stop: watch::Receiver<bool>,
) {
    debug!(key = %key, "worker started");
    loop {
        let outcome = match reconciler.reconcile(&key, trigger, &abort).await {
            Ok(outcome) => outcome,
            Err(err) => {
                METRICS.inc_store_retries();
                let retry_in = reconciler.config().backoff_base;
                warn!(key = %key, error = %err, retry_in_ms = retry_in.as_millis() as u64, "reconcile pass failed; requeued");
                Outcome::Failed { retry_in }
            }
        };
        debug!(key = %key, ?outcome, "pass finished");
        if outcome.is_terminal() {
            break;
        }

        if let Some(pending) = drain(&mut triggers, None) {
            trigger = pending;
            continue;
        }

        let requeue = outcome.requeue();
        let deadline = requeue.map(|(delay, _)| Instant::now() + delay);
        let timer = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = stop.changed() => break,
            received = triggers.recv() => match received {
                Some(first) => trigger = drain(&mut triggers, Some(first)).unwrap_or(first),
                None => break,
            },
            _ = timer => trigger = requeue.map_or(Trigger::Explicit, |(_, t)| t),
        }
    }
    debug!(key = %key, "worker stopped");
}

/// Collapse every queued trigger (plus `first`) into the strongest one.
fn drain(rx: &mut mpsc::UnboundedReceiver<Trigger>, first: Option<Trigger>) -> Option<Trigger> {
    let mut merged = first;
    while let Ok(next) = rx.try_recv() {
        merged = Some(merged.map_or(next, |current| current.max(next)));
    }
    merged
}
