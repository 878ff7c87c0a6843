use rand::RngExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;

/// Largest exponent applied to the base delay.
pub const MAX_BACKOFF_SHIFT: u32 = 10;

/// Exponential backoff with bounded jitter.
///
/// Delay for attempt `a` (0-indexed) is `base * 2^min(a, 10) + jitter`, where
/// jitter is uniform in `[0, base / 4]`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Deterministic part of the delay.
    pub fn floor(&self, attempt: u32) -> Duration {
        let multiplier = 1u32 << attempt.min(MAX_BACKOFF_SHIFT);
        self.base.saturating_mul(multiplier)
    }

    /// Upper bound of the random component.
    pub fn max_jitter(&self) -> Duration {
        self.base / 4
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let floor = self.floor(attempt);
        let jitter_range_ms = u64::try_from(self.max_jitter().as_millis()).unwrap_or(u64::MAX);
        if jitter_range_ms == 0 {
            return floor;
        }
        let jitter_ms = rand::rng().random_range(0..=jitter_range_ms);
        floor.saturating_add(Duration::from_millis(jitter_ms))
    }
}

/// Sleep for `delay` unless `token` fires first.
pub async fn sleep_or_cancel(
    delay: Duration,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    tokio::select! {
        _ = token.cancelled() => Err(DownloadError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn floor_doubles_per_attempt() {
        let backoff = Backoff::new(Duration::from_millis(100));
        assert_eq!(backoff.floor(0), Duration::from_millis(100));
        assert_eq!(backoff.floor(1), Duration::from_millis(200));
        assert_eq!(backoff.floor(2), Duration::from_millis(400));
    }

    #[test]
    fn shift_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(1));
        assert_eq!(backoff.floor(10), Duration::from_millis(1024));
        assert_eq!(backoff.floor(25), Duration::from_millis(1024));
    }

    #[test]
    fn tiny_base_has_no_jitter() {
        let backoff = Backoff::new(Duration::from_millis(3));
        assert_eq!(backoff.delay(0), Duration::from_millis(3));
    }

    #[tokio::test]
    async fn sleep_is_cancellable() {
        let token = CancellationToken::new();
        token.cancel();
        let result = sleep_or_cancel(Duration::from_secs(60), &token).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_delay_within_bounds(base_ms in 1u64..2_000, attempt in 0u32..=MAX_BACKOFF_SHIFT) {
            let base = Duration::from_millis(base_ms);
            let backoff = Backoff::new(base);
            let delay = backoff.delay(attempt);
            let floor = base * (1u32 << attempt);
            prop_assert!(delay >= floor);
            prop_assert!(delay <= floor + base / 4);
        }

        #[test]
        fn prop_floor_non_decreasing(base_ms in 1u64..2_000, attempt in 0u32..30) {
            let backoff = Backoff::new(Duration::from_millis(base_ms));
            prop_assert!(backoff.floor(attempt + 1) >= backoff.floor(attempt));
        }
    }
}
