//! Controller configuration.

use std::time::Duration;

use resource_store::RetryPolicy;
use tracing::warn;

use crate::domain::condition::DEFAULT_HISTORY_LIMIT;
use crate::domain::error::{CartonError, Result};

/// Tunables shared by the reconcile loop and the pipeline executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Wall-clock budget of one full pipeline run.
    pub run_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Used when a record does not declare `syncPeriod`.
    pub default_sync_period: Duration,
    pub store_retry: RetryPolicy,
    pub history_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(10 * 60),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(5 * 60),
            default_sync_period: Duration::from_secs(10 * 60),
            store_retry: RetryPolicy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ControllerConfig {
    /// Read `CARTON_*` overrides from the environment.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let secs = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring invalid configuration value");
                    None
                }
            }
        };

        if let Some(v) = secs("CARTON_RUN_TIMEOUT_SECS") {
            config.run_timeout = Duration::from_secs(v);
        }
        if let Some(v) = secs("CARTON_BACKOFF_BASE_SECS") {
            config.backoff_base = Duration::from_secs(v);
        }
        if let Some(v) = secs("CARTON_BACKOFF_MAX_SECS") {
            config.backoff_max = Duration::from_secs(v);
        }
        if let Some(v) = secs("CARTON_SYNC_PERIOD_SECS") {
            config.default_sync_period = Duration::from_secs(v);
        }
        if let Some(v) = secs("CARTON_STORE_RETRIES") {
            config.store_retry.max_attempts = v.clamp(1, u32::MAX as u64) as u32;
        }
        config
    }

    /// Sync period of a record: its own `syncPeriod` or the default.
    pub fn sync_period_for(&self, declared: Option<&str>) -> Result<Duration> {
        match declared {
            Some(raw) => parse_duration(raw),
            None => Ok(self.default_sync_period),
        }
    }
}

/// Parse durations such as `0`, `30s`, `10m`, `1h30m`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    let invalid = || CartonError::InvalidSpec(format!("invalid duration '{raw}'"));
    if input.is_empty() {
        return Err(invalid());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return Err(invalid()),
        };
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        total = total
            .checked_add(n.checked_mul(unit).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}
