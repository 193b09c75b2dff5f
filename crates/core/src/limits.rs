//! Process-wide capacity limits and worker pool sizing.
//!
//! Both are supplied once at startup and treated as immutable for the
//! lifetime of an engine. [`Limits::validate`] and
//! [`WorkerPoolConfig::validate`] are the only checks allowed to abort
//! construction.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Queue depth fraction above which the engine reports itself unhealthy.
pub const UNHEALTHY_QUEUE_FRACTION: f64 = 0.9;

/// Admission and dispatch limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub max_concurrent_jobs: usize,
    pub max_queue_depth: usize,
    pub cpu_limit_percent: f64,
    pub memory_limit_mb: u64,
    /// Execution-time budget per job; exceeding it is observability only.
    pub step_latency_limit_ms: u64,
    /// Time-in-queue budget; exceeding it evicts the job as expired.
    pub queue_wait_limit_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            max_queue_depth: 200,
            cpu_limit_percent: 85.0,
            memory_limit_mb: 4096,
            step_latency_limit_ms: 30_000,
            queue_wait_limit_ms: 300_000,
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_jobs == 0 {
            return Err(misconfigured("maxConcurrentJobs must be at least 1"));
        }
        if self.max_queue_depth == 0 {
            return Err(misconfigured("maxQueueDepth must be at least 1"));
        }
        if !(self.cpu_limit_percent > 0.0 && self.cpu_limit_percent <= 100.0) {
            return Err(misconfigured("cpuLimitPercent must be in (0, 100]"));
        }
        if self.memory_limit_mb == 0 {
            return Err(misconfigured("memoryLimitMB must be at least 1"));
        }
        if self.step_latency_limit_ms == 0 {
            return Err(misconfigured("stepLatencyLimitMs must be at least 1"));
        }
        if self.queue_wait_limit_ms == 0 {
            return Err(misconfigured("queueWaitLimitMs must be at least 1"));
        }
        Ok(())
    }

    /// Depth above which health reporting flips to unhealthy.
    pub fn unhealthy_depth(&self) -> usize {
        (self.max_queue_depth as f64 * UNHEALTHY_QUEUE_FRACTION).floor() as usize
    }

    /// Whether a resource reading is within the dispatch limits.
    pub fn admits(&self, cpu_percent: f64, memory_mb: u64) -> bool {
        cpu_percent <= self.cpu_limit_percent && memory_mb <= self.memory_limit_mb
    }
}

/// Worker pool sizing and autoscaling thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Transient allowance above `max_workers` during a spike.
    pub burst_capacity: usize,
    /// CPU percent above which the pool refuses to grow.
    pub cpu_limit: f64,
    /// Memory (MB) above which the pool refuses to grow.
    pub memory_limit: u64,
    /// Consecutive favourable samples required before adding a worker.
    #[serde(default = "default_scale_up_samples")]
    pub scale_up_samples: u32,
    /// Consecutive idle samples required before removing a worker.
    #[serde(default = "default_scale_down_samples")]
    pub scale_down_samples: u32,
    /// Minimum time a worker must sit idle before it can be removed.
    #[serde(default = "default_scale_down_cooldown_ms")]
    pub scale_down_cooldown_ms: u64,
}

fn default_scale_up_samples() -> u32 {
    3
}

fn default_scale_down_samples() -> u32 {
    10
}

fn default_scale_down_cooldown_ms() -> u64 {
    30_000
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            burst_capacity: 2,
            cpu_limit: 80.0,
            memory_limit: 4096,
            scale_up_samples: default_scale_up_samples(),
            scale_down_samples: default_scale_down_samples(),
            scale_down_cooldown_ms: default_scale_down_cooldown_ms(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.min_workers == 0 {
            return Err(misconfigured("minWorkers must be at least 1"));
        }
        if self.max_workers < self.min_workers {
            return Err(misconfigured("maxWorkers must be >= minWorkers"));
        }
        if !(self.cpu_limit > 0.0 && self.cpu_limit <= 100.0) {
            return Err(misconfigured("cpuLimit must be in (0, 100]"));
        }
        if self.memory_limit == 0 {
            return Err(misconfigured("memoryLimit must be at least 1"));
        }
        if self.scale_up_samples == 0 {
            return Err(misconfigured("scaleUpSamples must be at least 1"));
        }
        if self.scale_down_samples <= self.scale_up_samples {
            return Err(misconfigured(
                "scaleDownSamples must be greater than scaleUpSamples",
            ));
        }
        Ok(())
    }

    /// Hard upper bound on the worker count, burst included.
    pub fn ceiling(&self) -> usize {
        self.max_workers + self.burst_capacity
    }

    /// Whether a resource reading leaves headroom for another worker.
    pub fn has_headroom(&self, cpu_percent: f64, memory_mb: u64) -> bool {
        cpu_percent < self.cpu_limit && memory_mb < self.memory_limit
    }
}

fn misconfigured(msg: &str) -> CoreError {
    CoreError::Misconfigured(msg.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Limits::default().validate().is_ok());
        assert!(WorkerPoolConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_queue_depth_rejected() {
        let limits = Limits {
            max_queue_depth: 0,
            ..Limits::default()
        };
        assert_matches!(limits.validate(), Err(CoreError::Misconfigured(_)));
    }

    #[test]
    fn cpu_limit_above_100_rejected() {
        let limits = Limits {
            cpu_limit_percent: 120.0,
            ..Limits::default()
        };
        assert_matches!(limits.validate(), Err(CoreError::Misconfigured(_)));
    }

    #[test]
    fn max_below_min_workers_rejected() {
        let config = WorkerPoolConfig {
            min_workers: 4,
            max_workers: 2,
            ..WorkerPoolConfig::default()
        };
        assert_matches!(config.validate(), Err(CoreError::Misconfigured(_)));
    }

    #[test]
    fn scale_down_must_be_slower_than_scale_up() {
        let config = WorkerPoolConfig {
            scale_up_samples: 5,
            scale_down_samples: 5,
            ..WorkerPoolConfig::default()
        };
        assert_matches!(config.validate(), Err(CoreError::Misconfigured(_)));
    }

    #[test]
    fn unhealthy_depth_is_ninety_percent() {
        let limits = Limits {
            max_queue_depth: 200,
            ..Limits::default()
        };
        assert_eq!(limits.unhealthy_depth(), 180);
    }

    #[test]
    fn ceiling_includes_burst() {
        let config = WorkerPoolConfig {
            max_workers: 4,
            burst_capacity: 3,
            ..WorkerPoolConfig::default()
        };
        assert_eq!(config.ceiling(), 7);
    }

    #[test]
    fn limits_admit_at_boundary() {
        let limits = Limits::default();
        assert!(limits.admits(limits.cpu_limit_percent, limits.memory_limit_mb));
        assert!(!limits.admits(limits.cpu_limit_percent + 0.1, 0));
        assert!(!limits.admits(0.0, limits.memory_limit_mb + 1));
    }

    #[test]
    fn pool_config_deserializes_with_default_hysteresis() {
        let raw = serde_json::json!({
            "minWorkers": 1,
            "maxWorkers": 3,
            "burstCapacity": 1,
            "cpuLimit": 75.0,
            "memoryLimit": 2048
        });
        let config: WorkerPoolConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.scale_up_samples, 3);
        assert_eq!(config.scale_down_samples, 10);
        assert!(config.validate().is_ok());
    }
}
