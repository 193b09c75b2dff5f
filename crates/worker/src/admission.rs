//! Synchronous admission: every submission is either queued or refused
//! with a typed [`AdmissionError`] before the call returns.
//!
//! Checks run in order: payload validation, queue depth, deadline, id
//! uniqueness, then per-source fairness. The queue lock is held from the
//! depth check through the push, so depth can never exceed the limit under
//! concurrent callers.

use std::sync::Arc;

use chrono::Utc;
use quantgate_core::job::{Job, JobRequest, JobSource, JobStatus};
use quantgate_core::limits::Limits;
use quantgate_events::{EventBus, JobEvent, JobEventType};
use tokio::sync::{Mutex, Notify};

use crate::error::AdmissionError;
use crate::fairness::FairnessGate;
use crate::metrics::EngineMetrics;
use crate::queue::JobQueue;
use crate::settings::FairnessConfig;
use crate::store::JobStore;

pub struct AdmissionController {
    limits: Limits,
    queue: Arc<Mutex<JobQueue>>,
    store: Arc<dyn JobStore>,
    metrics: Arc<EngineMetrics>,
    events: Arc<EventBus>,
    fairness: Option<Mutex<FairnessGate>>,
    /// Wakes the dispatcher after a successful push.
    wake: Arc<Notify>,
}

impl AdmissionController {
    pub fn new(
        limits: Limits,
        queue: Arc<Mutex<JobQueue>>,
        store: Arc<dyn JobStore>,
        metrics: Arc<EngineMetrics>,
        events: Arc<EventBus>,
        fairness: Option<FairnessConfig>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            limits,
            queue,
            store,
            metrics,
            events,
            fairness: fairness.map(|config| Mutex::new(FairnessGate::new(config))),
            wake,
        }
    }

    /// Admit a new submission.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Job, AdmissionError> {
        let now = Utc::now();
        let job = match request.into_job(now) {
            Ok(job) => job,
            Err(e) => {
                return Err(self.reject(AdmissionError::Validation(e.to_string()), None));
            }
        };
        self.admit(job, true).await
    }

    /// Re-admit a failed job for another attempt.
    ///
    /// Goes through the same depth and deadline checks as new work, but is
    /// not charged against the fairness bucket and may reuse its own id.
    pub async fn readmit(&self, mut job: Job) -> Result<Job, AdmissionError> {
        let now = Utc::now();
        job.source = JobSource::Retry;
        job.status = JobStatus::Enqueued;
        job.enqueued_at = now;
        job.started_at = None;
        job.finished_at = None;
        job.next_retry_at = None;
        self.admit(job, false).await
    }

    async fn admit(&self, job: Job, fresh: bool) -> Result<Job, AdmissionError> {
        let now = Utc::now();
        let mut queue = self.queue.lock().await;

        let depth = queue.depth();
        if depth >= self.limits.max_queue_depth {
            return Err(self.reject(
                AdmissionError::Backpressure {
                    depth,
                    max: self.limits.max_queue_depth,
                },
                Some(&job),
            ));
        }

        if job.is_past_deadline(now) {
            return Err(self.reject(
                AdmissionError::ExpiredBeforeAdmission {
                    deadline: job.deadline,
                },
                Some(&job),
            ));
        }

        if fresh {
            if self.store.get(job.id).await.is_some() {
                return Err(self.reject(AdmissionError::DuplicateJobId(job.id), Some(&job)));
            }
            if let Some(gate) = &self.fairness {
                if !gate.lock().await.try_admit(job.source) {
                    return Err(self.reject(
                        AdmissionError::RateLimited { from: job.source },
                        Some(&job),
                    ));
                }
            }
        }

        if let Err(full) = queue.push(job.clone()) {
            return Err(self.reject(
                AdmissionError::Backpressure {
                    depth: full.depth,
                    max: full.max,
                },
                Some(&job),
            ));
        }
        self.store.put(job.clone()).await;
        let depth = queue.depth();
        drop(queue);

        self.metrics.job_transition(job.kind, JobStatus::Enqueued);
        self.events.publish(
            JobEvent::new(JobEventType::Enqueued)
                .for_job(job.id, job.kind)
                .with_detail(serde_json::json!({
                    "priority": job.priority,
                    "source": job.source,
                    "retryCount": job.retry_count,
                    "queueDepth": depth,
                })),
        );
        tracing::debug!(
            job_id = %job.id,
            kind = %job.kind,
            priority = %job.priority,
            source = %job.source,
            queue_depth = depth,
            "Job admitted",
        );
        self.wake.notify_one();
        Ok(job)
    }

    fn reject(&self, error: AdmissionError, job: Option<&Job>) -> AdmissionError {
        self.metrics.rejection(error.reason());
        let mut event = JobEvent::new(JobEventType::Rejected).with_detail(serde_json::json!({
            "reason": error.reason(),
            "message": error.to_string(),
        }));
        if let Some(job) = job {
            event = event.for_job(job.id, job.kind);
        }
        self.events.publish(event);
        tracing::info!(reason = error.reason(), error = %error, "Job rejected");
        error
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
