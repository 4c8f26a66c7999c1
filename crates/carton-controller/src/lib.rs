//! Carton reconciliation.
//!
//! `Reconciler` runs single passes, `worker` keeps one task per record,
//! `Controller` wires workers to store watches, and `LocalHarness` drives
//! passes against an in-memory store for dry runs.

pub mod backoff;
pub mod controller;
pub mod local;
pub mod reconciler;
pub mod tailer;
pub mod worker;

pub use backoff::Backoff;
pub use controller::Controller;
pub use local::{LocalHarness, LocalOptions, LocalReport, RecordReport};
pub use reconciler::{record_status, Outcome, Reconciler, Trigger, CLEANUP_FINALIZER};
pub use tailer::{spawn_tailer, TailerHandle};
pub use worker::{spawn_worker, WorkerHandle};
