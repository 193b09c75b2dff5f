//! Persisting status changes together with their side effects.

use std::sync::Arc;

use quantgate_core::job::{Job, JobStatus};
use quantgate_core::scheduling::state_machine;
use quantgate_events::{EventBus, JobEvent, JobEventType, ProgressHub};

use crate::metrics::EngineMetrics;
use crate::store::JobStore;

/// Writes a job's new status to the store, counts it, and announces it.
/// Once a job is finished its progress streams are closed.
#[derive(Clone)]
pub struct JobRecorder {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) progress: Arc<ProgressHub>,
}

impl JobRecorder {
    pub fn new(
        store: Arc<dyn JobStore>,
        metrics: Arc<EngineMetrics>,
        events: Arc<EventBus>,
        progress: Arc<ProgressHub>,
    ) -> Self {
        Self {
            store,
            metrics,
            events,
            progress,
        }
    }

    /// Record `job` (already carrying its new status) moving out of `from`.
    ///
    /// Returns false, and records nothing, if the state machine forbids the
    /// transition. `Failed -> Failed` is allowed: it finalizes a job whose
    /// pending retry was abandoned.
    pub async fn record(
        &self,
        job: &Job,
        from: JobStatus,
        event_type: JobEventType,
        detail: serde_json::Value,
    ) -> bool {
        let to = job.status;
        let finalizing_retry = from == JobStatus::Failed && to == JobStatus::Failed;
        if !finalizing_retry {
            if let Err(e) = state_machine::validate_transition(from, to) {
                tracing::error!(job_id = %job.id, error = %e, "Refusing status change");
                return false;
            }
        }

        self.store.put(job.clone()).await;
        if !finalizing_retry {
            self.metrics.job_transition(job.kind, to);
        }
        self.events.publish(
            JobEvent::new(event_type)
                .for_job(job.id, job.kind)
                .with_detail(detail),
        );
        if job.is_finished() {
            self.progress.close(job.id).await;
        }
        tracing::debug!(
            job_id = %job.id,
            kind = %job.kind,
            from = %from,
            to = %to,
            "Job status changed",
        );
        true
    }
}
