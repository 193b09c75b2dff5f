//! Dynamically sized pool of worker tasks.
//!
//! Each worker is a Tokio task fed through its own single-slot channel. The
//! dispatcher is the only component that hands out work or resizes the
//! pool, so an idle worker it selects stays idle until it is assigned.
//! Handler failures and panics are caught per job and never end a worker.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use quantgate_core::autoscale::ScaleSample;
use quantgate_core::job::{Job, JobStatus};
use quantgate_core::limits::WorkerPoolConfig;
use quantgate_core::types::JobId;
use quantgate_events::JobEventType;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::handler::{HandlerRegistry, JobContext};
use crate::record::JobRecorder;
use crate::retry::RetryManager;

// ---------------------------------------------------------------------------
// Running jobs
// ---------------------------------------------------------------------------

/// Cancellation handles of jobs currently assigned to a worker.
///
/// When both are needed, the queue lock is always taken before this one.
#[derive(Default)]
pub struct RunningJobs {
    jobs: Mutex<HashMap<JobId, CancellationToken>>,
}

impl RunningJobs {
    pub async fn insert(&self, id: JobId, token: CancellationToken) {
        self.jobs.lock().await.insert(id, token);
    }

    pub async fn remove(&self, id: JobId) -> Option<CancellationToken> {
        self.jobs.lock().await.remove(&id)
    }

    /// Raise the cancellation signal of a running job.
    pub async fn cancel(&self, id: JobId) -> bool {
        match self.jobs.lock().await.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, id: JobId) -> bool {
        self.jobs.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn ids(&self) -> Vec<JobId> {
        self.jobs.lock().await.keys().copied().collect()
    }

    async fn drain(&self) -> Vec<(JobId, CancellationToken)> {
        self.jobs.lock().await.drain().collect()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

pub(crate) struct Assignment {
    pub job: Job,
    pub cancel: CancellationToken,
}

struct Executor {
    handlers: HandlerRegistry,
    recorder: JobRecorder,
    retry: Arc<RetryManager>,
    running: Arc<RunningJobs>,
    step_latency: Duration,
    wake: Arc<Notify>,
}

impl Executor {
    async fn execute(&self, worker_id: u32, assignment: Assignment) {
        let Assignment { mut job, cancel } = assignment;
        let (id, kind) = (job.id, job.kind);
        tracing::debug!(job_id = %id, kind = %kind, worker_id, "Executing job");

        let started = Instant::now();
        let result = if cancel.is_cancelled() {
            Err(HandlerError::Canceled)
        } else {
            match self.handlers.get(kind) {
                None => Err(HandlerError::NoHandler(kind)),
                Some(handler) => {
                    let ctx = JobContext::new(
                        job.clone(),
                        cancel.clone(),
                        self.recorder.progress.sink(id),
                    );
                    match AssertUnwindSafe(handler.run(ctx)).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
                    }
                }
            }
        };
        let elapsed = started.elapsed();

        self.recorder.metrics.job_runtime(kind, elapsed);
        if elapsed > self.step_latency {
            self.recorder.metrics.step_latency_exceeded(kind);
            self.recorder.events.publish(
                quantgate_events::JobEvent::new(JobEventType::StepLatencyExceeded)
                    .for_job(id, kind)
                    .with_detail(serde_json::json!({
                        "elapsedMs": elapsed.as_millis() as u64,
                        "limitMs": self.step_latency.as_millis() as u64,
                    })),
            );
            tracing::warn!(
                job_id = %id,
                kind = %kind,
                elapsed_ms = elapsed.as_millis() as u64,
                limit_ms = self.step_latency.as_millis() as u64,
                "Job exceeded step latency limit",
            );
        }

        let elapsed_ms = elapsed.as_millis() as u64;
        match result {
            Ok(()) => {
                // Leave the running map before the terminal status is stored.
                self.running.remove(id).await;
                job.finish(JobStatus::Succeeded, None);
                self.recorder
                    .record(
                        &job,
                        JobStatus::Running,
                        JobEventType::Succeeded,
                        serde_json::json!({ "elapsedMs": elapsed_ms }),
                    )
                    .await;
                tracing::info!(job_id = %id, kind = %kind, elapsed_ms, "Job succeeded");
            }
            Err(e) if RetryManager::will_retry(&job, &e) && !cancel.is_cancelled() => {
                // Still registered as running while the retry is scheduled:
                // a cancel raised meanwhile trips the token the retry waits on.
                self.retry.on_failure(job, e, cancel).await;
                self.running.remove(id).await;
            }
            Err(e) => {
                self.running.remove(id).await;
                self.retry.on_failure(job, e, cancel).await;
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

struct WorkerState {
    busy: AtomicBool,
    /// Milliseconds since the pool epoch when the worker last went idle.
    idle_since_ms: AtomicU64,
}

struct WorkerSlot {
    id: u32,
    tx: mpsc::Sender<Assignment>,
    state: Arc<WorkerState>,
    handle: JoinHandle<()>,
}

async fn worker_loop(
    id: u32,
    mut rx: mpsc::Receiver<Assignment>,
    state: Arc<WorkerState>,
    executor: Arc<Executor>,
    epoch: Instant,
) {
    tracing::debug!(worker_id = id, "Worker started");
    while let Some(assignment) = rx.recv().await {
        executor.execute(id, assignment).await;
        state
            .idle_since_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
        state.busy.store(false, Ordering::SeqCst);
        executor.wake.notify_one();
    }
    tracing::debug!(worker_id = id, "Worker stopped");
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: Mutex<Vec<WorkerSlot>>,
    running: Arc<RunningJobs>,
    executor: Arc<Executor>,
    next_id: AtomicU32,
    epoch: Instant,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        handlers: HandlerRegistry,
        recorder: JobRecorder,
        retry: Arc<RetryManager>,
        step_latency: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        let running = Arc::new(RunningJobs::default());
        Self {
            config,
            workers: Mutex::new(Vec::new()),
            running: Arc::clone(&running),
            executor: Arc::new(Executor {
                handlers,
                recorder,
                retry,
                running,
                step_latency,
                wake,
            }),
            next_id: AtomicU32::new(1),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn running(&self) -> &Arc<RunningJobs> {
        &self.running
    }

    fn spawn_worker(&self, workers: &mut Vec<WorkerSlot>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::new(WorkerState {
            busy: AtomicBool::new(false),
            idle_since_ms: AtomicU64::new(self.epoch.elapsed().as_millis() as u64),
        });
        let handle = tokio::spawn(worker_loop(
            id,
            rx,
            Arc::clone(&state),
            Arc::clone(&self.executor),
            self.epoch,
        ));
        workers.push(WorkerSlot {
            id,
            tx,
            state,
            handle,
        });
    }

    /// Spawn workers until the pool holds at least `min_workers`.
    pub async fn ensure_min(&self) -> usize {
        let mut workers = self.workers.lock().await;
        while workers.len() < self.config.min_workers {
            self.spawn_worker(&mut workers);
        }
        workers.len()
    }

    /// Add one worker unless the burst ceiling is reached.
    pub async fn grow(&self) -> bool {
        let mut workers = self.workers.lock().await;
        if workers.len() >= self.config.ceiling() {
            return false;
        }
        self.spawn_worker(&mut workers);
        tracing::info!(workers = workers.len(), "Worker pool grew");
        true
    }

    /// Retire the longest-idle worker unless at `min_workers`.
    pub async fn shrink(&self) -> bool {
        let mut workers = self.workers.lock().await;
        if workers.len() <= self.config.min_workers {
            return false;
        }
        let victim = workers
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.state.busy.load(Ordering::SeqCst))
            .min_by_key(|(_, w)| w.state.idle_since_ms.load(Ordering::SeqCst))
            .map(|(i, _)| i);
        let Some(index) = victim else {
            return false;
        };
        // Dropping the sender ends the worker loop.
        let slot = workers.remove(index);
        tracing::info!(worker_id = slot.id, workers = workers.len(), "Worker pool shrank");
        true
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn idle_count(&self) -> usize {
        self.workers
            .lock()
            .await
            .iter()
            .filter(|w| !w.state.busy.load(Ordering::SeqCst))
            .count()
    }

    pub async fn running_count(&self) -> usize {
        self.running.len().await
    }

    /// Current pool state for the autoscaler.
    pub async fn sample(&self, queue_depth: usize, has_headroom: bool) -> ScaleSample {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let workers = self.workers.lock().await;
        let idle: Vec<&WorkerSlot> = workers
            .iter()
            .filter(|w| !w.state.busy.load(Ordering::SeqCst))
            .collect();
        let longest_idle_ms = idle
            .iter()
            .map(|w| now_ms.saturating_sub(w.state.idle_since_ms.load(Ordering::SeqCst)))
            .max()
            .unwrap_or(0);
        ScaleSample {
            queue_depth,
            workers: workers.len(),
            idle_workers: idle.len(),
            longest_idle: Duration::from_millis(longest_idle_ms),
            has_headroom,
        }
    }

    /// Hand a job to an idle worker. Gives the job back if none is free.
    pub(crate) async fn assign(&self, assignment: Assignment) -> Result<u32, Assignment> {
        let workers = self.workers.lock().await;
        let Some(slot) = workers
            .iter()
            .find(|w| !w.state.busy.load(Ordering::SeqCst))
        else {
            return Err(assignment);
        };

        slot.state.busy.store(true, Ordering::SeqCst);
        match slot.tx.try_send(assignment) {
            Ok(()) => Ok(slot.id),
            Err(e) => {
                slot.state.busy.store(false, Ordering::SeqCst);
                tracing::error!(worker_id = slot.id, "Idle worker refused assignment");
                Err(match e {
                    mpsc::error::TrySendError::Full(a) | mpsc::error::TrySendError::Closed(a) => a,
                })
            }
        }
    }

    /// Stop every worker. In-flight jobs get `grace` to finish; the ids of
    /// jobs still running afterwards are returned for the caller to fail.
    pub async fn shutdown(&self, grace: Duration) -> Vec<JobId> {
        let slots: Vec<WorkerSlot> = std::mem::take(&mut *self.workers.lock().await);
        let count = slots.len();

        let mut handles = Vec::with_capacity(count);
        for slot in slots {
            drop(slot.tx);
            handles.push(slot.handle);
        }
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Workers still busy after grace period, aborting",
            );
            for abort in aborts {
                abort.abort();
            }
        }

        let abandoned: Vec<JobId> = self
            .running
            .drain()
            .await
            .into_iter()
            .map(|(id, token)| {
                token.cancel();
                id
            })
            .collect();
        tracing::info!(workers = count, abandoned = abandoned.len(), "Worker pool stopped");
        abandoned
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use quantgate_core::backoff::BackoffPolicy;
    use quantgate_core::job::{JobKind, JobRequest};
    use quantgate_core::limits::Limits;
    use quantgate_core::payload::{JobPayload, LivePayload};
    use quantgate_events::{EventBus, ProgressHub};

    use super::*;
    use crate::admission::AdmissionController;
    use crate::handler::JobHandler;
    use crate::metrics::EngineMetrics;
    use crate::queue::JobQueue;
    use crate::store::{InMemoryJobStore, JobStore};

    struct Sleepy(Duration);

    #[async_trait]
    impl JobHandler for Sleepy {
        async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
            tokio::select! {
                _ = ctx.cancelled() => Err(HandlerError::Canceled),
                _ = tokio::time::sleep(self.0) => Ok(()),
            }
        }
    }

    struct Panicky;

    #[async_trait]
    impl JobHandler for Panicky {
        async fn run(&self, _ctx: JobContext) -> Result<(), HandlerError> {
            panic!("strategy blew up");
        }
    }

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: 1,
            max_workers: 2,
            burst_capacity: 1,
            ..WorkerPoolConfig::default()
        }
    }

    fn pool(handlers: HandlerRegistry) -> (WorkerPool, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        let metrics = Arc::new(EngineMetrics::new());
        let events = Arc::new(EventBus::default());
        let wake = Arc::new(Notify::new());
        let recorder = JobRecorder::new(
            store.clone(),
            Arc::clone(&metrics),
            Arc::clone(&events),
            Arc::new(ProgressHub::default()),
        );
        let admission = Arc::new(AdmissionController::new(
            Limits::default(),
            Arc::new(Mutex::new(JobQueue::new(10))),
            store.clone(),
            metrics,
            events,
            None,
            Arc::clone(&wake),
        ));
        let retry = Arc::new(RetryManager::new(
            admission,
            recorder.clone(),
            BackoffPolicy::new(Duration::from_secs(30)),
        ));
        let pool = WorkerPool::new(
            config(),
            handlers,
            recorder,
            retry,
            Duration::from_secs(5),
            wake,
        );
        (pool, store)
    }

    async fn running_job(store: &InMemoryJobStore) -> Job {
        let mut job = JobRequest::new(JobPayload::Live(LivePayload {
            strategy_id: "s".to_string(),
            symbol: "BTCUSDT".to_string(),
            exchange: "okx".to_string(),
        }))
        .with_max_retries(0)
        .into_job(Utc::now())
        .unwrap();
        job.status = JobStatus::Running;
        store.put(job.clone()).await;
        job
    }

    async fn wait_for_status(store: &InMemoryJobStore, id: JobId, status: JobStatus) {
        for _ in 0..200 {
            if store.get(id).await.map(|j| j.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {status}");
    }

    #[tokio::test]
    async fn grows_to_ceiling_and_shrinks_to_min() {
        let (pool, _) = pool(HandlerRegistry::new());
        assert_eq!(pool.ensure_min().await, 1);
        assert!(pool.grow().await);
        assert!(pool.grow().await);
        assert!(!pool.grow().await);
        assert_eq!(pool.worker_count().await, 3);

        assert!(pool.shrink().await);
        assert!(pool.shrink().await);
        assert!(!pool.shrink().await);
        assert_eq!(pool.worker_count().await, 1);
    }

    #[tokio::test]
    async fn assigned_job_runs_to_success() {
        let handlers =
            HandlerRegistry::new().register(JobKind::Live, Sleepy(Duration::from_millis(10)));
        let (pool, store) = pool(handlers);
        pool.ensure_min().await;

        let job = running_job(&store).await;
        let token = CancellationToken::new();
        pool.running().insert(job.id, token.clone()).await;
        assert!(pool
            .assign(Assignment {
                job: job.clone(),
                cancel: token,
            })
            .await
            .is_ok());
        assert_eq!(pool.idle_count().await, 0);

        wait_for_status(&store, job.id, JobStatus::Succeeded).await;
        assert!(!pool.running().cancel(job.id).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.running_count().await, 0);
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn assign_without_idle_worker_returns_job() {
        let (pool, store) = pool(HandlerRegistry::new());
        let job = running_job(&store).await;
        let result = pool
            .assign(Assignment {
                job,
                cancel: CancellationToken::new(),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn panic_is_contained_and_worker_survives() {
        let handlers = HandlerRegistry::new()
            .register(JobKind::Live, Panicky);
        let (pool, store) = pool(handlers);
        pool.ensure_min().await;

        let job = running_job(&store).await;
        pool.assign(Assignment {
            job: job.clone(),
            cancel: CancellationToken::new(),
        })
        .await
        .ok();

        wait_for_status(&store, job.id, JobStatus::Failed).await;
        let failed = store.get(job.id).await.unwrap();
        assert!(failed.error.unwrap().contains("strategy blew up"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.worker_count().await, 1);
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn cancel_signal_reaches_handler() {
        let handlers =
            HandlerRegistry::new().register(JobKind::Live, Sleepy(Duration::from_secs(30)));
        let (pool, store) = pool(handlers);
        pool.ensure_min().await;

        let job = running_job(&store).await;
        let token = CancellationToken::new();
        pool.running().insert(job.id, token.clone()).await;
        pool.assign(Assignment {
            job: job.clone(),
            cancel: token,
        })
        .await
        .ok();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pool.running().cancel(job.id).await);
        wait_for_status(&store, job.id, JobStatus::Canceled).await;
    }

    #[tokio::test]
    async fn shutdown_abandons_jobs_past_grace() {
        let handlers =
            HandlerRegistry::new().register(JobKind::Live, Sleepy(Duration::from_secs(30)));
        let (pool, store) = pool(handlers);
        pool.ensure_min().await;

        let job = running_job(&store).await;
        let token = CancellationToken::new();
        pool.running().insert(job.id, token.clone()).await;
        pool.assign(Assignment {
            job: job.clone(),
            cancel: token,
        })
        .await
        .ok();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let abandoned = pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(abandoned, vec![job.id]);
        assert_eq!(pool.worker_count().await, 0);
    }
}
