//! Process-wide atomic counters.
//!
//! Increment at the call site; [`Metrics::flush`] emits all values as one
//! `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    reconciles_started: AtomicU64,
    reconciles_succeeded: AtomicU64,
    reconciles_failed: AtomicU64,
    stage_runs: AtomicU64,
    store_retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            reconciles_started: AtomicU64::new(0),
            reconciles_succeeded: AtomicU64::new(0),
            reconciles_failed: AtomicU64::new(0),
            stage_runs: AtomicU64::new(0),
            store_retries: AtomicU64::new(0),
        }
    }

    pub fn inc_reconciles_started(&self) {
        self.reconciles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconciles_succeeded(&self) {
        self.reconciles_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconciles_failed(&self) {
        self.reconciles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stage_runs(&self) {
        self.stage_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_store_retries(&self) {
        self.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            reconciles_started = self.reconciles_started(),
            reconciles_succeeded = self.reconciles_succeeded(),
            reconciles_failed = self.reconciles_failed(),
            stage_runs = self.stage_runs(),
            store_retries = self.store_retries(),
        );
    }

    pub fn reconciles_started(&self) -> u64 {
        self.reconciles_started.load(Ordering::Relaxed)
    }

    pub fn reconciles_succeeded(&self) -> u64 {
        self.reconciles_succeeded.load(Ordering::Relaxed)
    }

    pub fn reconciles_failed(&self) -> u64 {
        self.reconciles_failed.load(Ordering::Relaxed)
    }

    pub fn stage_runs(&self) -> u64 {
        self.stage_runs.load(Ordering::Relaxed)
    }

    pub fn store_retries(&self) -> u64 {
        self.store_retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.reconciles_started.store(0, Ordering::Relaxed);
        self.reconciles_succeeded.store(0, Ordering::Relaxed);
        self.reconciles_failed.store(0, Ordering::Relaxed);
        self.stage_runs.store(0, Ordering::Relaxed);
        self.store_retries.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_reset() {
        let m = Metrics::new();
        m.inc_reconciles_started();
        m.inc_reconciles_started();
        m.inc_reconciles_failed();
        m.inc_stage_runs();
        assert_eq!(m.reconciles_started(), 2);
        assert_eq!(m.reconciles_failed(), 1);
        assert_eq!(m.stage_runs(), 1);
        assert_eq!(m.reconciles_succeeded(), 0);

        m.reset();
        assert_eq!(m.reconciles_started(), 0);
        assert_eq!(m.stage_runs(), 0);
    }
}
