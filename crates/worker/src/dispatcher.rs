//! The scheduler loop.
//!
//! One task coordinates the queue, the pool and the resource snapshot. Each
//! tick it evicts jobs that waited past the queue-wait limit or their
//! deadline, whether or not anything can be dispatched, then dispatches
//! eligible jobs to idle workers in strict priority order while resources
//! allow, and feeds the autoscaler. It never awaits job execution, so slow
//! jobs cannot stall bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quantgate_core::autoscale::{Autoscaler, ScaleDecision};
use quantgate_core::job::{Job, JobStatus};
use quantgate_core::limits::Limits;
use quantgate_events::{JobEvent, JobEventType};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::pool::{Assignment, WorkerPool};
use crate::queue::JobQueue;
use crate::record::JobRecorder;
use crate::resources::ResourceMonitor;

/// What one tick did. Used by logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub evicted: usize,
    pub expired: usize,
    pub dispatched: usize,
    pub scaled: Option<ScaleDecisionApplied>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecisionApplied {
    Grew,
    Shrank,
}

pub struct Dispatcher {
    limits: Limits,
    queue: Arc<Mutex<JobQueue>>,
    pool: Arc<WorkerPool>,
    monitor: Arc<ResourceMonitor>,
    recorder: JobRecorder,
    autoscaler: Autoscaler,
    tick_interval: Duration,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        limits: Limits,
        queue: Arc<Mutex<JobQueue>>,
        pool: Arc<WorkerPool>,
        monitor: Arc<ResourceMonitor>,
        recorder: JobRecorder,
        tick_interval: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        let autoscaler = Autoscaler::new(pool.config().clone());
        Self {
            limits,
            queue,
            pool,
            monitor,
            recorder,
            autoscaler,
            tick_interval,
            wake,
        }
    }

    /// Run until cancelled. Ticks on the interval and whenever admission or
    /// a finishing worker signals new work or free capacity.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "Dispatcher started",
        );

        let wake = Arc::clone(&self.wake);
        loop {
            let scale = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => true,
                _ = wake.notified() => false,
            };
            let report = self.tick(scale).await;
            if report.evicted + report.expired + report.dispatched > 0 {
                tracing::debug!(
                    evicted = report.evicted,
                    expired = report.expired,
                    dispatched = report.dispatched,
                    "Dispatch cycle",
                );
            }
        }
    }

    /// One cycle. Scaling decisions are only taken on timer ticks so that
    /// hysteresis counts samples at a steady rate.
    pub async fn tick(&mut self, scale: bool) -> TickReport {
        let mut report = TickReport::default();

        let evicted = {
            let queue_wait = chrono::Duration::milliseconds(self.limits.queue_wait_limit_ms as i64);
            self.queue.lock().await.evict_stale(Utc::now(), queue_wait)
        };
        report.evicted = evicted.len();
        for job in evicted {
            self.recorder.metrics.queue_wait_exceeded();
            let waited_ms = job.queue_wait(Utc::now()).num_milliseconds();
            tracing::warn!(
                job_id = %job.id,
                kind = %job.kind,
                waited_ms,
                limit_ms = self.limits.queue_wait_limit_ms,
                "Evicting stale job",
            );
            self.recorder
                .record(
                    &job,
                    JobStatus::Enqueued,
                    JobEventType::QueueWaitExceeded,
                    serde_json::json!({
                        "waitedMs": waited_ms,
                        "limitMs": self.limits.queue_wait_limit_ms,
                    }),
                )
                .await;
        }

        let expired = self.queue.lock().await.expire_past_deadline(Utc::now());
        report.expired = expired.len();
        for job in expired {
            self.record_expired(&job).await;
        }

        let snapshot = self.monitor.latest();
        if snapshot.within_limits(&self.limits) {
            let (dispatched, expired) = self.dispatch().await;
            report.dispatched = dispatched;
            report.expired += expired;
        }

        if scale {
            let depth = self.queue.lock().await.depth();
            let sample = self
                .pool
                .sample(depth, snapshot.has_headroom(self.pool.config()))
                .await;
            report.scaled = match self.autoscaler.observe(&sample) {
                ScaleDecision::Grow if self.pool.grow().await => Some(ScaleDecisionApplied::Grew),
                ScaleDecision::Shrink if self.pool.shrink().await => {
                    Some(ScaleDecisionApplied::Shrank)
                }
                _ => None,
            };
            if let Some(applied) = report.scaled {
                let workers = self.pool.worker_count().await;
                self.recorder.events.publish(
                    JobEvent::new(JobEventType::WorkerScaled).with_detail(serde_json::json!({
                        "direction": match applied {
                            ScaleDecisionApplied::Grew => "up",
                            ScaleDecisionApplied::Shrank => "down",
                        },
                        "workers": workers,
                        "queueDepth": depth,
                    })),
                );
                // A new worker can take work right away.
                if applied == ScaleDecisionApplied::Grew && snapshot.within_limits(&self.limits) {
                    report.dispatched += self.dispatch().await.0;
                }
            }
        }

        report
    }

    /// Hand queued jobs to idle workers up to the running cap.
    async fn dispatch(&self) -> (usize, usize) {
        let cap = self
            .pool
            .worker_count()
            .await
            .min(self.limits.max_concurrent_jobs);
        let mut dispatched = 0;
        let mut expired_total = 0;

        loop {
            if self.pool.running_count().await >= cap || self.pool.idle_count().await == 0 {
                break;
            }

            let (job, expired, token) = {
                let mut queue = self.queue.lock().await;
                let popped = queue.pop(Utc::now());
                let token = CancellationToken::new();
                if let Some(job) = &popped.job {
                    // Registered while the queue is locked so a concurrent
                    // cancel finds the job in one place or the other.
                    self.pool.running().insert(job.id, token.clone()).await;
                }
                (popped.job, popped.expired, token)
            };

            expired_total += expired.len();
            for job in expired {
                self.record_expired(&job).await;
            }

            let Some(mut job) = job else {
                break;
            };

            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            self.recorder
                .record(
                    &job,
                    JobStatus::Enqueued,
                    JobEventType::Started,
                    serde_json::json!({
                        "retryCount": job.retry_count,
                        "queueWaitMs": job.queue_wait(Utc::now()).num_milliseconds(),
                    }),
                )
                .await;

            match self
                .pool
                .assign(Assignment {
                    job,
                    cancel: token,
                })
                .await
            {
                Ok(worker_id) => {
                    dispatched += 1;
                    tracing::debug!(worker_id, "Job dispatched");
                }
                Err(returned) => {
                    self.requeue(returned.job).await;
                    break;
                }
            }
        }

        (dispatched, expired_total)
    }

    async fn record_expired(&self, job: &Job) {
        tracing::info!(job_id = %job.id, kind = %job.kind, "Job expired in queue");
        self.recorder
            .record(
                job,
                JobStatus::Enqueued,
                JobEventType::Expired,
                serde_json::json!({ "reason": "deadline" }),
            )
            .await;
    }

    /// Undo a dispatch whose hand-off failed.
    async fn requeue(&self, mut job: Job) {
        let mut queue = self.queue.lock().await;
        self.pool.running().remove(job.id).await;
        job.status = JobStatus::Enqueued;
        job.started_at = None;
        self.recorder.store.put(job.clone()).await;
        queue.push_front(job);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use quantgate_core::backoff::BackoffPolicy;
    use quantgate_core::job::{JobKind, JobPriority, JobRequest};
    use quantgate_core::limits::WorkerPoolConfig;
    use quantgate_core::payload::{JobPayload, LivePayload};
    use quantgate_events::{EventBus, ProgressHub};

    use super::*;
    use crate::admission::AdmissionController;
    use crate::error::HandlerError;
    use crate::handler::{HandlerRegistry, JobContext, JobHandler};
    use crate::metrics::EngineMetrics;
    use crate::resources::ManualProbe;
    use crate::retry::RetryManager;
    use crate::store::{InMemoryJobStore, JobStore};

    struct Hold;

    #[async_trait]
    impl JobHandler for Hold {
        async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
            ctx.cancelled().await;
            Err(HandlerError::Canceled)
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        admission: Arc<AdmissionController>,
        store: Arc<InMemoryJobStore>,
        pool: Arc<WorkerPool>,
        probe: Arc<ManualProbe>,
        monitor: Arc<ResourceMonitor>,
        metrics: Arc<EngineMetrics>,
    }

    fn fixture(limits: Limits, pool_config: WorkerPoolConfig) -> Fixture {
        let queue = Arc::new(Mutex::new(JobQueue::new(limits.max_queue_depth)));
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
            limits.clone(),
            Arc::clone(&queue),
            store.clone(),
            Arc::clone(&metrics),
            events,
            None,
            Arc::clone(&wake),
        ));
        let retry = Arc::new(RetryManager::new(
            Arc::clone(&admission),
            recorder.clone(),
            BackoffPolicy::default(),
        ));
        let pool = Arc::new(WorkerPool::new(
            pool_config,
            HandlerRegistry::new().register_all(Arc::new(Hold)),
            recorder.clone(),
            retry,
            Duration::from_secs(30),
            Arc::clone(&wake),
        ));
        let probe = Arc::new(ManualProbe::new(10.0, 100));
        let monitor = Arc::new(ResourceMonitor::new(
            probe.clone(),
            limits.clone(),
            Duration::from_secs(1),
            Arc::clone(&metrics),
        ));
        let dispatcher = Dispatcher::new(
            limits,
            queue,
            Arc::clone(&pool),
            Arc::clone(&monitor),
            recorder,
            Duration::from_millis(10),
            wake,
        );
        Fixture {
            dispatcher,
            admission,
            store,
            pool,
            probe,
            monitor,
            metrics,
        }
    }

    fn request(priority: JobPriority) -> JobRequest {
        JobRequest::new(JobPayload::Live(LivePayload {
            strategy_id: "s".to_string(),
            symbol: "BTCUSDT".to_string(),
            exchange: "okx".to_string(),
        }))
        .with_priority(priority)
    }

    fn pool_config(min: usize, max: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: min,
            max_workers: max,
            burst_capacity: 0,
            ..WorkerPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn dispatches_high_priority_first() {
        let mut f = fixture(Limits::default(), pool_config(1, 1));
        f.pool.ensure_min().await;
        let low = f.admission.enqueue(request(JobPriority::Low)).await.unwrap();
        let high = f.admission.enqueue(request(JobPriority::High)).await.unwrap();

        let report = f.dispatcher.tick(false).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(f.store.get(high.id).await.unwrap().status, JobStatus::Running);
        assert_eq!(f.store.get(low.id).await.unwrap().status, JobStatus::Enqueued);
    }

    #[tokio::test]
    async fn running_cap_is_min_of_workers_and_limit() {
        let limits = Limits {
            max_concurrent_jobs: 2,
            ..Limits::default()
        };
        let mut f = fixture(limits, pool_config(3, 3));
        f.pool.ensure_min().await;
        for _ in 0..5 {
            f.admission.enqueue(request(JobPriority::Normal)).await.unwrap();
        }

        let report = f.dispatcher.tick(false).await;
        assert_eq!(report.dispatched, 2);
        assert_eq!(f.pool.running_count().await, 2);
    }

    #[tokio::test]
    async fn withholds_dispatch_over_resource_limits() {
        let mut f = fixture(Limits::default(), pool_config(1, 1));
        f.pool.ensure_min().await;
        f.admission.enqueue(request(JobPriority::High)).await.unwrap();

        f.probe.set(99.0, 100);
        f.monitor.sample_once().await;
        assert_eq!(f.dispatcher.tick(false).await.dispatched, 0);

        f.probe.set(10.0, 100);
        f.monitor.sample_once().await;
        assert_eq!(f.dispatcher.tick(false).await.dispatched, 1);
    }

    #[tokio::test]
    async fn failed_sample_blocks_dispatch() {
        let mut f = fixture(Limits::default(), pool_config(1, 1));
        f.pool.ensure_min().await;
        f.admission.enqueue(request(JobPriority::High)).await.unwrap();

        f.probe.set_failing(true);
        f.monitor.sample_once().await;
        assert_eq!(f.dispatcher.tick(false).await.dispatched, 0);
    }

    #[tokio::test]
    async fn evicts_jobs_past_queue_wait_limit() {
        let limits = Limits {
            queue_wait_limit_ms: 20,
            ..Limits::default()
        };
        let mut f = fixture(limits, pool_config(1, 1));
        let job = f.admission.enqueue(request(JobPriority::Normal)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = f.dispatcher.tick(false).await;
        assert_eq!(report.evicted, 1);

        let evicted = f.store.get(job.id).await.unwrap();
        assert_eq!(evicted.status, JobStatus::Expired);
        assert_eq!(f.metrics.queue_wait_exceeded_total(), 1);
        assert_eq!(f.metrics.jobs_total(JobKind::Live, JobStatus::Expired), 1);
    }

    #[tokio::test]
    async fn expires_deadline_while_dispatch_is_withheld() {
        let mut f = fixture(Limits::default(), pool_config(1, 1));
        f.pool.ensure_min().await;
        let head = f.admission.enqueue(request(JobPriority::Normal)).await.unwrap();
        let doomed = f
            .admission
            .enqueue(
                request(JobPriority::Normal)
                    .with_deadline(Utc::now() + chrono::Duration::milliseconds(20)),
            )
            .await
            .unwrap();

        f.probe.set(99.0, 100);
        f.monitor.sample_once().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let report = f.dispatcher.tick(false).await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.expired, 1);

        let expired = f.store.get(doomed.id).await.unwrap();
        assert_eq!(expired.status, JobStatus::Expired);
        assert_eq!(f.store.get(head.id).await.unwrap().status, JobStatus::Enqueued);
        assert_eq!(f.metrics.jobs_total(JobKind::Live, JobStatus::Expired), 1);
        assert_eq!(f.dispatcher.queue.lock().await.depth(), 1);
    }

    #[tokio::test]
    async fn grows_pool_under_sustained_backlog() {
        let config = WorkerPoolConfig {
            min_workers: 1,
            max_workers: 2,
            burst_capacity: 1,
            scale_up_samples: 2,
            scale_down_samples: 5,
            ..WorkerPoolConfig::default()
        };
        let mut f = fixture(Limits::default(), config);
        f.pool.ensure_min().await;
        for _ in 0..6 {
            f.admission.enqueue(request(JobPriority::Normal)).await.unwrap();
        }

        f.dispatcher.tick(true).await;
        let report = f.dispatcher.tick(true).await;
        assert_eq!(report.scaled, Some(ScaleDecisionApplied::Grew));
        assert_eq!(f.pool.worker_count().await, 2);
        assert_eq!(f.pool.running_count().await, 2);
    }
}
