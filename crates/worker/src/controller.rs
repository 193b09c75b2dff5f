//! Public facade over the engine.
//!
//! A [`Controller`] is an owned, explicitly constructed instance: it holds
//! its own queue, store handle, pool and loops, so several can coexist in
//! one process (tests do this routinely). Admission works whether or not
//! the controller is started; jobs admitted while stopped wait in the queue
//! until [`Controller::start`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use quantgate_core::error::CoreError;
use quantgate_core::job::{Job, JobKind, JobRequest, JobStatus};
use quantgate_core::limits::{Limits, WorkerPoolConfig};
use quantgate_core::types::{JobId, Timestamp};
use quantgate_events::{EventBus, JobEvent, JobEventType, OptimizationEvent, ProgressHub};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::dispatcher::Dispatcher;
use crate::error::AdmissionError;
use crate::handler::HandlerRegistry;
use crate::metrics::{EngineMetrics, Gauges};
use crate::pool::WorkerPool;
use crate::queue::JobQueue;
use crate::record::JobRecorder;
use crate::resources::{ResourceMonitor, ResourceProbe};
use crate::retry::{RetryManager, SHUTDOWN_REASON};
use crate::settings::EngineSettings;
use crate::store::JobStore;

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Jobs in the store, by status, for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub enqueued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
    pub canceled: usize,
}

impl KindCounts {
    fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Enqueued => self.enqueued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Expired => self.expired += 1,
            JobStatus::Canceled => self.canceled += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub sample_ok: bool,
    pub sampled_at: Timestamp,
    /// How long usage has been over limits, if it currently is.
    pub over_limit_for_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub started: bool,
    pub queue_depth: usize,
    pub running_count: usize,
    pub worker_count: usize,
    pub pending_retries: usize,
    pub per_kind_counts: BTreeMap<JobKind, KindCounts>,
    pub limits: Limits,
    pub pool: WorkerPoolConfig,
    pub resources: ResourceView,
    pub is_healthy: bool,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Lifecycle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Controller {
    settings: EngineSettings,
    queue: Arc<Mutex<JobQueue>>,
    recorder: JobRecorder,
    monitor: Arc<ResourceMonitor>,
    admission: Arc<AdmissionController>,
    retry: Arc<RetryManager>,
    pool: Arc<WorkerPool>,
    wake: Arc<Notify>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Controller {
    /// Build an engine. Invalid settings are the only construction error.
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn JobStore>,
        probe: Arc<dyn ResourceProbe>,
        handlers: HandlerRegistry,
    ) -> Result<Self, CoreError> {
        settings.validate()?;

        let queue = Arc::new(Mutex::new(JobQueue::new(settings.limits.max_queue_depth)));
        let metrics = Arc::new(EngineMetrics::new());
        let events = Arc::new(EventBus::default());
        let progress = Arc::new(ProgressHub::default());
        let wake = Arc::new(Notify::new());

        let recorder = JobRecorder::new(
            Arc::clone(&store),
            Arc::clone(&metrics),
            Arc::clone(&events),
            progress,
        );
        let monitor = Arc::new(ResourceMonitor::new(
            probe,
            settings.limits.clone(),
            settings.sample_interval,
            Arc::clone(&metrics),
        ));
        let admission = Arc::new(AdmissionController::new(
            settings.limits.clone(),
            Arc::clone(&queue),
            store,
            metrics,
            events,
            settings.fairness,
            Arc::clone(&wake),
        ));
        let retry = Arc::new(RetryManager::new(
            Arc::clone(&admission),
            recorder.clone(),
            settings.backoff(),
        ));
        let pool = Arc::new(WorkerPool::new(
            settings.pool.clone(),
            handlers,
            recorder.clone(),
            Arc::clone(&retry),
            std::time::Duration::from_millis(settings.limits.step_latency_limit_ms),
            Arc::clone(&wake),
        ));

        Ok(Self {
            settings,
            queue,
            recorder,
            monitor,
            admission,
            retry,
            pool,
            wake,
            lifecycle: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // -- lifecycle --------------------------------------------------------

    /// Start sampling, spin up `min_workers` and the scheduler loop.
    /// Calling it on a started controller does nothing.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            tracing::debug!("Controller already started");
            return;
        }

        self.monitor.sample_once().await;
        let cancel = CancellationToken::new();

        let monitor_task = {
            let monitor = Arc::clone(&self.monitor);
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.run(cancel).await })
        };

        let workers = self.pool.ensure_min().await;

        let dispatcher = Dispatcher::new(
            self.settings.limits.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.pool),
            Arc::clone(&self.monitor),
            self.recorder.clone(),
            self.settings.tick_interval,
            Arc::clone(&self.wake),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run(cancel.clone()));

        *lifecycle = Some(Lifecycle {
            cancel,
            tasks: vec![monitor_task, dispatcher_task],
        });

        self.recorder.events.publish(
            JobEvent::new(JobEventType::EngineStarted)
                .with_detail(serde_json::json!({ "workers": workers })),
        );
        tracing::info!(workers, "Controller started");
    }

    /// Stop dispatching, give in-flight jobs the shutdown grace period, then
    /// halt every loop. Jobs still running afterwards, and retries still
    /// waiting on backoff, are failed with reason `shutdown`. Queued jobs
    /// stay queued. Calling it on a stopped controller does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            tracing::debug!("Controller already stopped");
            return;
        };

        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Engine task ended abnormally");
            }
        }

        let abandoned = self.pool.shutdown(self.settings.shutdown_grace).await;
        for id in &abandoned {
            let Some(mut job) = self.recorder.store.get(*id).await else {
                continue;
            };
            if job.status != JobStatus::Running {
                continue;
            }
            job.finish(JobStatus::Failed, Some(SHUTDOWN_REASON.to_string()));
            self.recorder
                .record(
                    &job,
                    JobStatus::Running,
                    JobEventType::Failed,
                    serde_json::json!({ "error": SHUTDOWN_REASON }),
                )
                .await;
            tracing::warn!(job_id = %job.id, kind = %job.kind, "Abandoned running job at shutdown");
        }
        let retries = self.retry.abandon_all().await;

        self.recorder.events.publish(
            JobEvent::new(JobEventType::EngineStopped).with_detail(serde_json::json!({
                "abandonedJobs": abandoned.len(),
                "abandonedRetries": retries,
            })),
        );
        tracing::info!(
            abandoned_jobs = abandoned.len(),
            abandoned_retries = retries,
            "Controller stopped",
        );
    }

    pub async fn is_started(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    // -- jobs -------------------------------------------------------------

    pub async fn enqueue_job(&self, request: JobRequest) -> Result<Job, AdmissionError> {
        self.admission.enqueue(request).await
    }

    /// Cancel a job.
    ///
    /// A queued job is removed and marked canceled; a running job only has
    /// its cancellation signal raised; a job waiting on retry backoff is
    /// canceled. Returns false for unknown or already finished jobs.
    pub async fn cancel_job(&self, id: JobId) -> bool {
        {
            let mut queue = self.queue.lock().await;
            if let Some(mut job) = queue.remove(id) {
                drop(queue);
                job.finish(JobStatus::Canceled, None);
                tracing::info!(job_id = %id, "Canceled queued job");
                return self
                    .recorder
                    .record(
                        &job,
                        JobStatus::Enqueued,
                        JobEventType::Canceled,
                        serde_json::json!({ "phase": "queued" }),
                    )
                    .await;
            }
            if self.pool.running().cancel(id).await {
                tracing::info!(job_id = %id, "Cancellation requested for running job");
                return true;
            }
        }
        self.retry.cancel_pending(id).await
    }

    pub async fn get_job(&self, id: JobId) -> Option<Job> {
        self.recorder.store.get(id).await
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.recorder.store.list().await
    }

    // -- observation ------------------------------------------------------

    pub async fn get_status(&self) -> EngineStatus {
        let started = self.is_started().await;
        let queue_depth = self.queue.lock().await.depth();
        let running_count = self.pool.running_count().await;
        let worker_count = self.pool.worker_count().await;
        let pending_retries = self.retry.pending_count().await;

        let mut per_kind_counts: BTreeMap<JobKind, KindCounts> =
            JobKind::ALL.iter().map(|k| (*k, KindCounts::default())).collect();
        for job in self.recorder.store.list().await {
            per_kind_counts.entry(job.kind).or_default().add(job.status);
        }

        let snapshot = self.monitor.latest();
        let limits = &self.settings.limits;
        let is_healthy = queue_depth <= limits.unhealthy_depth()
            && !snapshot.over_limits_for(self.settings.health_sustain);

        EngineStatus {
            started,
            queue_depth,
            running_count,
            worker_count,
            pending_retries,
            per_kind_counts,
            limits: limits.clone(),
            pool: self.settings.pool.clone(),
            resources: ResourceView {
                cpu_percent: snapshot.cpu_percent,
                memory_mb: snapshot.memory_mb,
                sample_ok: snapshot.ok,
                sampled_at: snapshot.sampled_at,
                over_limit_for_ms: snapshot
                    .over_limit_since
                    .map(|since| since.elapsed().as_millis() as u64),
            },
            is_healthy,
            timestamp: Utc::now(),
        }
    }

    /// Prometheus text exposition of counters and current gauges.
    pub async fn render_metrics(&self) -> String {
        let snapshot = self.monitor.latest();
        let gauges = Gauges {
            queue_depth: self.queue.lock().await.depth(),
            workers: self.pool.worker_count().await,
            workers_running: self.pool.running_count().await,
            cpu_percent: snapshot.cpu_percent,
            memory_percent: snapshot.memory_percent(&self.settings.limits),
        };
        self.recorder.metrics.render(&gauges)
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.recorder.metrics
    }

    /// Lifecycle events for every job.
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.recorder.events.subscribe()
    }

    /// Ordered optimization progress for one job. The stream ends when the
    /// job finishes.
    pub async fn subscribe_progress(
        &self,
        id: JobId,
    ) -> Result<mpsc::Receiver<OptimizationEvent>, CoreError> {
        let job = self
            .recorder
            .store
            .get(id)
            .await
            .ok_or(CoreError::NotFound { entity: "job", id })?;
        if job.is_finished() {
            return Err(CoreError::Conflict(format!(
                "job {id} already finished with status {}",
                job.status
            )));
        }
        Ok(self.recorder.progress.subscribe(id).await)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(lifecycle) = self.lifecycle.get_mut() {
            lifecycle.cancel.cancel();
        }
    }
}
