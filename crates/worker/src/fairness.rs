//! Per-source token buckets.

use std::collections::HashMap;

use quantgate_core::job::JobSource;
use tokio::time::Instant;

use crate::settings::FairnessConfig;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_take(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> u32 {
        self.refill(Instant::now());
        self.tokens.floor() as u32
    }
}

/// One bucket per [`JobSource`], created lazily.
#[derive(Debug)]
pub struct FairnessGate {
    config: FairnessConfig,
    buckets: HashMap<JobSource, TokenBucket>,
}

impl FairnessGate {
    pub fn new(config: FairnessConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
        }
    }

    pub fn try_admit(&mut self, source: JobSource) -> bool {
        let config = self.config;
        self.buckets
            .entry(source)
            .or_insert_with(|| TokenBucket::new(config.capacity, config.refill_per_sec))
            .try_take()
    }
}
