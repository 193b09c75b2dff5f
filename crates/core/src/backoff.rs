//! Retry backoff: `base × 2^retryCount` plus jitter in `[0, base)`,
//! capped at `max_delay`.

use std::time::Duration;

use rand::Rng;

/// Base delay used when none is configured.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);

/// Upper bound on any single backoff.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponent is clamped so the shift cannot overflow.
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE,
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    /// Deterministic part of the delay for the attempt after `retry_count`
    /// failures.
    pub fn exponential(&self, retry_count: u32) -> Duration {
        let factor = 1u32 << retry_count.min(MAX_EXPONENT);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay with a caller-chosen jitter, capped at `max_delay`.
    pub fn delay_with_jitter(&self, retry_count: u32, jitter: Duration) -> Duration {
        self.exponential(retry_count)
            .saturating_add(jitter)
            .min(self.max_delay)
    }

    /// Delay with random jitter in `[0, base)`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..base_ms))
        };
        self.delay_with_jitter(retry_count, jitter)
    }
}
