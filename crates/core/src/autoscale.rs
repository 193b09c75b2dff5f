//! Worker pool autoscaling decisions with hysteresis.
//!
//! Pure logic: the pool feeds one [`ScaleSample`] per scheduler tick and
//! applies the returned [`ScaleDecision`]. Growing needs `scale_up_samples`
//! consecutive favourable samples; shrinking needs `scale_down_samples`
//! consecutive idle samples *and* a worker idle for at least the cooldown,
//! so the pool grows quickly and shrinks slowly.

use std::time::Duration;

use crate::limits::WorkerPoolConfig;

/// Snapshot of pool state fed to the autoscaler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleSample {
    pub queue_depth: usize,
    pub workers: usize,
    pub idle_workers: usize,
    /// Longest time any currently idle worker has been idle.
    pub longest_idle: Duration,
    /// Whether current CPU / memory leave headroom for another worker.
    /// A failed resource sample is reported as `false`.
    pub has_headroom: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Grow,
    Shrink,
}

#[derive(Debug, Clone)]
pub struct Autoscaler {
    config: WorkerPoolConfig,
    up_streak: u32,
    down_streak: u32,
}

impl Autoscaler {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            up_streak: 0,
            down_streak: 0,
        }
    }

    pub fn observe(&mut self, sample: &ScaleSample) -> ScaleDecision {
        if sample.workers < self.config.min_workers {
            self.reset();
            return ScaleDecision::Grow;
        }

        let wants_more = sample.queue_depth > 0
            && sample.idle_workers == 0
            && sample.has_headroom
            && sample.workers < self.config.ceiling();
        if wants_more {
            self.down_streak = 0;
            self.up_streak += 1;
            if self.up_streak >= self.config.scale_up_samples {
                self.up_streak = 0;
                return ScaleDecision::Grow;
            }
            return ScaleDecision::Hold;
        }
        self.up_streak = 0;

        let cooldown = Duration::from_millis(self.config.scale_down_cooldown_ms);
        let can_shed = sample.workers > self.config.min_workers
            && sample.idle_workers > 0
            && sample.queue_depth == 0
            && sample.longest_idle >= cooldown;
        if can_shed {
            self.down_streak += 1;
            if self.down_streak >= self.config.scale_down_samples {
                self.down_streak = 0;
                return ScaleDecision::Shrink;
            }
        } else {
            self.down_streak = 0;
        }
        ScaleDecision::Hold
    }

    fn reset(&mut self) {
        self.up_streak = 0;
        self.down_streak = 0;
    }
}
