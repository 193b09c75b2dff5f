//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for job lifecycle
//! [`JobEvent`]s. It is designed to be shared via `Arc<EventBus>` between
//! the admission path, workers, the dispatcher, and any observers.

use chrono::{DateTime, Utc};
use quantgate_core::job::JobKind;
use quantgate_core::types::JobId;
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobEventType {
    #[serde(rename = "job.enqueued")]
    Enqueued,
    #[serde(rename = "job.rejected")]
    Rejected,
    #[serde(rename = "job.started")]
    Started,
    #[serde(rename = "job.succeeded")]
    Succeeded,
    #[serde(rename = "job.failed")]
    Failed,
    #[serde(rename = "job.retry_scheduled")]
    RetryScheduled,
    #[serde(rename = "job.expired")]
    Expired,
    #[serde(rename = "job.canceled")]
    Canceled,
    #[serde(rename = "job.step_latency_exceeded")]
    StepLatencyExceeded,
    #[serde(rename = "job.queue_wait_exceeded")]
    QueueWaitExceeded,
    #[serde(rename = "pool.scaled")]
    WorkerScaled,
    #[serde(rename = "engine.started")]
    EngineStarted,
    #[serde(rename = "engine.stopped")]
    EngineStopped,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Enqueued => "job.enqueued",
            JobEventType::Rejected => "job.rejected",
            JobEventType::Started => "job.started",
            JobEventType::Succeeded => "job.succeeded",
            JobEventType::Failed => "job.failed",
            JobEventType::RetryScheduled => "job.retry_scheduled",
            JobEventType::Expired => "job.expired",
            JobEventType::Canceled => "job.canceled",
            JobEventType::StepLatencyExceeded => "job.step_latency_exceeded",
            JobEventType::QueueWaitExceeded => "job.queue_wait_exceeded",
            JobEventType::WorkerScaled => "pool.scaled",
            JobEventType::EngineStarted => "engine.started",
            JobEventType::EngineStopped => "engine.stopped",
        }
    }
}

/// A lifecycle event emitted by the engine.
///
/// Constructed via [`JobEvent::new`] and enriched with the builder
/// methods [`for_job`](JobEvent::for_job) and
/// [`with_detail`](JobEvent::with_detail).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub event_type: JobEventType,

    /// The job concerned, if any (pool and engine events have none).
    pub job_id: Option<JobId>,

    pub kind: Option<JobKind>,

    /// Free-form JSON carrying event-specific data.
    pub detail: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(event_type: JobEventType) -> Self {
        Self {
            event_type,
            job_id: None,
            kind: None,
            detail: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    /// Attach the job the event refers to.
    pub fn for_job(mut self, job_id: JobId, kind: JobKind) -> Self {
        self.job_id = Some(job_id);
        self.kind = Some(kind);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`JobEvent`]. Lifecycle events are
/// advisory: a lagging subscriber loses the oldest events rather than
/// slowing the engine down.
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// A receiver more than `capacity` events behind sees
    /// `RecvError::Lagged` and skips ahead.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fan `event` out to current subscribers. Dropped when there are none.
    pub fn publish(&self, event: JobEvent) {
        tracing::trace!(event_type = event.event_type.as_str(), "Publishing job event");
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
