//! Periodic CPU / memory sampling.
//!
//! [`ResourceMonitor`] polls a [`ResourceProbe`] on a fixed interval and
//! publishes the latest [`ResourceSnapshot`] through a `watch` channel.
//! Sampling is fail-closed: a probe error yields a snapshot that admits
//! nothing and leaves no headroom for scaling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use quantgate_core::limits::{Limits, WorkerPoolConfig};
use quantgate_core::types::Timestamp;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::metrics::EngineMetrics;

const PROC_STAT: &str = "/proc/stat";
const PROC_SELF_STATUS: &str = "/proc/self/status";

/// One successful reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_mb: u64,
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> Result<ResourceSample, ProbeError>;
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    /// False when the latest sample failed.
    pub ok: bool,
    pub sampled_at: Timestamp,
    /// Start of the current run of over-limit samples, if any.
    pub over_limit_since: Option<Instant>,
}

impl ResourceSnapshot {
    fn initial() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_mb: 0,
            ok: true,
            sampled_at: Utc::now(),
            over_limit_since: None,
        }
    }

    /// Whether dispatch may proceed under `limits`.
    pub fn within_limits(&self, limits: &Limits) -> bool {
        self.ok && limits.admits(self.cpu_percent, self.memory_mb)
    }

    /// Whether the pool may add a worker.
    pub fn has_headroom(&self, pool: &WorkerPoolConfig) -> bool {
        self.ok && pool.has_headroom(self.cpu_percent, self.memory_mb)
    }

    /// Whether usage has been over limits for at least `window`.
    pub fn over_limits_for(&self, window: Duration) -> bool {
        self.over_limit_since
            .is_some_and(|since| since.elapsed() >= window)
    }

    pub fn memory_percent(&self, limits: &Limits) -> f64 {
        self.memory_mb as f64 / limits.memory_limit_mb as f64 * 100.0
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    limits: Limits,
    interval: Duration,
    metrics: Arc<EngineMetrics>,
    tx: watch::Sender<ResourceSnapshot>,
}

impl ResourceMonitor {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        limits: Limits,
        interval: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (tx, _) = watch::channel(ResourceSnapshot::initial());
        Self {
            probe,
            limits,
            interval,
            metrics,
            tx,
        }
    }

    pub fn latest(&self) -> ResourceSnapshot {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.tx.subscribe()
    }

    /// Take one sample and publish it.
    pub async fn sample_once(&self) -> ResourceSnapshot {
        let previous = self.latest();
        let snapshot = match self.probe.sample().await {
            Ok(sample) => {
                let over = !self.limits.admits(sample.cpu_percent, sample.memory_mb);
                ResourceSnapshot {
                    cpu_percent: sample.cpu_percent,
                    memory_mb: sample.memory_mb,
                    ok: true,
                    sampled_at: Utc::now(),
                    over_limit_since: over.then(|| {
                        previous.over_limit_since.unwrap_or_else(Instant::now)
                    }),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Resource sample failed, treating as over limit");
                self.metrics.sample_failure();
                ResourceSnapshot {
                    ok: false,
                    sampled_at: Utc::now(),
                    over_limit_since: Some(previous.over_limit_since.unwrap_or_else(Instant::now)),
                    ..previous
                }
            }
        };
        self.tx.send_replace(snapshot);
        snapshot
    }

    /// Sample every `interval` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Resource monitor started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Resource monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = self.sample_once().await;
                    tracing::trace!(
                        cpu_percent = snapshot.cpu_percent,
                        memory_mb = snapshot.memory_mb,
                        ok = snapshot.ok,
                        "Resource sample",
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Reads system CPU from `/proc/stat` and process RSS from
/// `/proc/self/status`. Linux only; elsewhere every sample fails.
#[derive(Default)]
pub struct ProcProbe {
    /// `(total, idle)` jiffies from the previous read.
    last: Mutex<Option<(u64, u64)>>,
}

impl ProcProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceProbe for ProcProbe {
    async fn sample(&self) -> Result<ResourceSample, ProbeError> {
        let stat = read(PROC_STAT).await?;
        let (total, idle) = parse_cpu_line(&stat).ok_or(ProbeError::Parse { path: PROC_STAT })?;

        let mut last = self.last.lock().await;
        let (d_total, d_idle) = match *last {
            Some((prev_total, prev_idle)) if total > prev_total => {
                (total - prev_total, idle.saturating_sub(prev_idle))
            }
            _ => (total, idle),
        };
        *last = Some((total, idle));
        drop(last);

        let cpu_percent = if d_total == 0 {
            0.0
        } else {
            (d_total.saturating_sub(d_idle)) as f64 / d_total as f64 * 100.0
        };

        let status = read(PROC_SELF_STATUS).await?;
        let rss_kb = parse_vm_rss_kb(&status).ok_or(ProbeError::Parse {
            path: PROC_SELF_STATUS,
        })?;

        Ok(ResourceSample {
            cpu_percent,
            memory_mb: rss_kb / 1024,
        })
    }
}

async fn read(path: &'static str) -> Result<String, ProbeError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProbeError::Io { path, source })
}

/// Sum of all jiffies and the idle share (idle + iowait) from the aggregate
/// `cpu` line.
fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((fields.iter().sum(), idle))
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// A probe whose readings are set by hand. Used by tests and demos.
#[derive(Default)]
pub struct ManualProbe {
    cpu_bits: AtomicU64,
    memory_mb: AtomicU64,
    failing: AtomicBool,
}

impl ManualProbe {
    pub fn new(cpu_percent: f64, memory_mb: u64) -> Self {
        let probe = Self::default();
        probe.set(cpu_percent, memory_mb);
        probe
    }

    pub fn set(&self, cpu_percent: f64, memory_mb: u64) {
        self.cpu_bits.store(cpu_percent.to_bits(), Ordering::Relaxed);
        self.memory_mb.store(memory_mb, Ordering::Relaxed);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl ResourceProbe for ManualProbe {
    async fn sample(&self) -> Result<ResourceSample, ProbeError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ProbeError::Unavailable("manual probe set to fail".to_string()));
        }
        Ok(ResourceSample {
            cpu_percent: f64::from_bits(self.cpu_bits.load(Ordering::Relaxed)),
            memory_mb: self.memory_mb.load(Ordering::Relaxed),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
