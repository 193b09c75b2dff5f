#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quantgate_core::job::{Job, JobPriority, JobRequest, JobStatus};
use quantgate_core::limits::{Limits, WorkerPoolConfig};
use quantgate_core::payload::{BacktestPayload, JobPayload, LivePayload};
use quantgate_core::types::JobId;
use quantgate_worker::{
    Controller, EngineSettings, HandlerError, HandlerRegistry, InMemoryJobStore, JobContext,
    JobHandler, JobStore, ManualProbe, ResourceProbe,
};

/// Fast-ticking settings suitable for tests.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        limits: Limits {
            max_concurrent_jobs: 4,
            max_queue_depth: 200,
            ..Limits::default()
        },
        pool: WorkerPoolConfig {
            min_workers: 2,
            max_workers: 4,
            burst_capacity: 1,
            ..WorkerPoolConfig::default()
        },
        sample_interval: Duration::from_millis(20),
        tick_interval: Duration::from_millis(5),
        shutdown_grace: Duration::from_millis(200),
        retry_base: Duration::from_millis(5),
        ..EngineSettings::default()
    }
}

pub fn build_controller(settings: EngineSettings, handlers: HandlerRegistry) -> Controller {
    build_controller_with(
        settings,
        Arc::new(InMemoryJobStore::new()),
        Arc::new(ManualProbe::new(10.0, 256)),
        handlers,
    )
}

pub fn build_controller_with(
    settings: EngineSettings,
    store: Arc<dyn JobStore>,
    probe: Arc<dyn ResourceProbe>,
    handlers: HandlerRegistry,
) -> Controller {
    Controller::new(settings, store, probe, handlers).expect("test settings are valid")
}

pub fn live_request() -> JobRequest {
    JobRequest::new(JobPayload::Live(LivePayload {
        strategy_id: "momentum".to_string(),
        symbol: "BTCUSDT".to_string(),
        exchange: "binance".to_string(),
    }))
}

pub fn backtest_request(priority: JobPriority) -> JobRequest {
    JobRequest::new(JobPayload::Backtest(BacktestPayload {
        strategy_id: "vegas".to_string(),
        symbol: "ETHUSDT".to_string(),
        timeframe: "1h".to_string(),
        start: "2024-01-01T00:00:00Z".parse().unwrap(),
        end: "2024-06-01T00:00:00Z".parse().unwrap(),
    }))
    .with_priority(priority)
}

/// Poll `check` every few milliseconds until it holds or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// In-memory store that stalls while persisting a scheduled retry, widening
/// the gap between a failed attempt and its retry being registered.
pub struct SlowRetryStore {
    inner: InMemoryJobStore,
    delay: Duration,
}

impl SlowRetryStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryJobStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl JobStore for SlowRetryStore {
    async fn get(&self, id: JobId) -> Option<Job> {
        self.inner.get(id).await
    }

    async fn put(&self, job: Job) {
        if job.status == JobStatus::Failed && job.next_retry_at.is_some() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.put(job).await;
    }

    async fn list(&self) -> Vec<Job> {
        self.inner.list().await
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Sleeps, then succeeds. Honors cancellation.
pub struct SleepHandler(pub Duration);

#[async_trait]
impl JobHandler for SleepHandler {
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(HandlerError::Canceled),
            _ = tokio::time::sleep(self.0) => Ok(()),
        }
    }
}

/// Always fails, counting attempts across clones.
#[derive(Clone, Default)]
pub struct FailingHandler {
    pub attempts: Arc<AtomicUsize>,
}

impl FailingHandler {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn run(&self, _ctx: JobContext) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::failed("exchange unavailable"))
    }
}

#[derive(Default)]
pub struct Recording {
    started: Mutex<Vec<JobId>>,
    in_flight: Mutex<HashSet<JobId>>,
    overlaps: AtomicUsize,
}

/// Records the order in which jobs start, and detects the same id running
/// twice at once. Clones share their records.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub record: Arc<Recording>,
    pub delay: Duration,
}

impl RecordingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn started(&self) -> Vec<JobId> {
        self.record.started.lock().unwrap().clone()
    }

    pub fn overlaps(&self) -> usize {
        self.record.overlaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let id = ctx.job.id;
        self.record.started.lock().unwrap().push(id);
        if !self.record.in_flight.lock().unwrap().insert(id) {
            self.record.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;
        self.record.in_flight.lock().unwrap().remove(&id);
        Ok(())
    }
}
