//! Capped exponential backoff between failed reconcile attempts.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before attempt `retry_count + 1`, given `retry_count`
    /// consecutive failures.
    ///
    /// Doubles from `base` and never exceeds the smaller of `max` and a
    /// non-zero `sync_period`.
    pub fn delay(&self, retry_count: u32, sync_period: Duration) -> Duration {
        let ceiling = if sync_period.is_zero() {
            self.max
        } else {
            self.max.min(sync_period)
        };
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
            .min(ceiling)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(5 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let backoff = Backoff::default();
        let never = Duration::ZERO;
        assert_eq!(backoff.delay(1, never), Duration::from_secs(5));
        assert_eq!(backoff.delay(2, never), Duration::from_secs(10));
        assert_eq!(backoff.delay(4, never), Duration::from_secs(40));
        assert_eq!(backoff.delay(10, never), Duration::from_secs(300));
        assert_eq!(backoff.delay(u32::MAX, never), Duration::from_secs(300));
    }

    #[test]
    fn test_delay_non_decreasing() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(90));
        let mut previous = Duration::ZERO;
        for n in 0..64 {
            let delay = backoff.delay(n, Duration::from_secs(60));
            assert!(delay >= previous, "attempt {n}: {delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
    }

    #[test]
    fn test_sync_period_caps_below_max() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(8, Duration::from_secs(30)), Duration::from_secs(30));
    }
}
