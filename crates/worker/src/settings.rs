//! Immutable engine settings, supplied once when a
//! [`Controller`](crate::Controller) is constructed.

use std::time::Duration;

use quantgate_core::backoff::{BackoffPolicy, DEFAULT_RETRY_BASE};
use quantgate_core::error::CoreError;
use quantgate_core::limits::{Limits, WorkerPoolConfig};

/// Default resource sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Default scheduler tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Default time in-flight jobs get to finish during `stop()`.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How long resources must stay over limits before health flips.
pub const DEFAULT_HEALTH_SUSTAIN: Duration = Duration::from_secs(10);

/// Per-source token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FairnessConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub limits: Limits,
    pub pool: WorkerPoolConfig,
    pub sample_interval: Duration,
    pub tick_interval: Duration,
    pub shutdown_grace: Duration,
    pub retry_base: Duration,
    pub health_sustain: Duration,
    /// `None` disables per-source rate limiting.
    pub fairness: Option<FairnessConfig>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            pool: WorkerPoolConfig::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            retry_base: DEFAULT_RETRY_BASE,
            health_sustain: DEFAULT_HEALTH_SUSTAIN,
            fairness: None,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.limits.validate()?;
        self.pool.validate()?;
        if self.sample_interval.is_zero() {
            return Err(CoreError::Misconfigured(
                "sample interval must be non-zero".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(CoreError::Misconfigured(
                "tick interval must be non-zero".to_string(),
            ));
        }
        if let Some(fairness) = &self.fairness {
            if fairness.capacity == 0 || !(fairness.refill_per_sec > 0.0) {
                return Err(CoreError::Misconfigured(
                    "fairness capacity and refill rate must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.retry_base)
    }
}
