//! Retry helpers for store access.
//!
//! Two failure modes are handled differently:
//! - transient errors (`StorageError::Unavailable`) are retried with capped
//!   exponential backoff, up to `RetryPolicy::max_attempts`;
//! - optimistic-write conflicts are resolved by re-reading the object and
//!   reapplying the mutation. A conflict is never dropped and never
//!   overwritten blind.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{ObjectKey, ResourceStore, StorageResult, StoredObject};

/// Upper bound on re-read/reapply rounds for a single logical write.
const MAX_CONFLICT_ROUNDS: u32 = 64;

/// Bounded retry policy for transient store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps; used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `op`, retrying transient failures according to `policy`.
///
/// Permanent errors are returned immediately. The last transient error is
/// returned once the attempt budget is exhausted.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(op = op_name, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient store error; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteTarget {
    Object,
    Status,
}

/// Read-modify-write the status section of `key`.
///
/// `mutate` receives the freshest copy of the object and may be invoked more
/// than once if a concurrent writer wins the race.
pub async fn update_status_with<F>(
    store: &dyn ResourceStore,
    key: &ObjectKey,
    policy: &RetryPolicy,
    mutate: F,
) -> StorageResult<StoredObject>
where
    F: FnMut(&mut StoredObject),
{
    read_modify_write(store, key, policy, WriteTarget::Status, mutate).await
}

/// Read-modify-write spec and metadata of `key`.
pub async fn update_object_with<F>(
    store: &dyn ResourceStore,
    key: &ObjectKey,
    policy: &RetryPolicy,
    mutate: F,
) -> StorageResult<StoredObject>
where
    F: FnMut(&mut StoredObject),
{
    read_modify_write(store, key, policy, WriteTarget::Object, mutate).await
}

async fn read_modify_write<F>(
    store: &dyn ResourceStore,
    key: &ObjectKey,
    policy: &RetryPolicy,
    target: WriteTarget,
    mut mutate: F,
) -> StorageResult<StoredObject>
where
    F: FnMut(&mut StoredObject),
{
    let mut last_conflict = None;
    for round in 1..=MAX_CONFLICT_ROUNDS {
        let mut candidate = retry_transient(policy, "get", || store.get(key)).await?;
        mutate(&mut candidate);

        let written = retry_transient(policy, "write", || {
            let candidate = candidate.clone();
            async move {
                match target {
                    WriteTarget::Object => store.update(candidate).await,
                    WriteTarget::Status => store.update_status(candidate).await,
                }
            }
        })
        .await;

        match written {
            Ok(object) => return Ok(object),
            Err(err) if err.is_conflict() => {
                debug!(key = %key, round, error = %err, "write conflict; re-reading");
                last_conflict = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_conflict.unwrap_or_else(|| StorageError::Conflict {
        key: key.to_string(),
        expected: 0,
        actual: 0,
    }))
}
