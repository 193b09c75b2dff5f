//! Per-job optimization progress streams.
//!
//! Unlike the lifecycle [`EventBus`](crate::EventBus), progress events are
//! delivered over one bounded `mpsc` channel per subscriber: each subscriber
//! sees events in publish order, and a full channel makes the publishing
//! handler wait instead of dropping events. A subscriber that stays full for
//! longer than [`SLOW_SUBSCRIBER_TIMEOUT`] or has gone away is pruned.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use quantgate_core::types::JobId;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

/// Per-subscriber buffer.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// How long a publisher waits on one full subscriber before dropping it.
pub const SLOW_SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(5);

/// A progress event emitted by an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum OptimizationEvent {
    /// One parameter combination was scored.
    #[serde(rename_all = "camelCase")]
    Evaluation {
        index: u64,
        params: BTreeMap<String, f64>,
        score: f64,
    },
    /// The search finished normally.
    #[serde(rename_all = "camelCase")]
    Completed {
        evaluations: u64,
        best_params: BTreeMap<String, f64>,
        best_score: f64,
    },
    /// The search stopped before exhausting the grid.
    #[serde(rename_all = "camelCase")]
    EarlyStop { evaluations: u64, reason: String },
    /// The search failed.
    Error { message: String },
}

impl OptimizationEvent {
    /// Whether no further events follow this one.
    pub fn is_final(&self) -> bool {
        !matches!(self, OptimizationEvent::Evaluation { .. })
    }

    /// The `event` tag value, also used as the SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            OptimizationEvent::Evaluation { .. } => "evaluation",
            OptimizationEvent::Completed { .. } => "completed",
            OptimizationEvent::EarlyStop { .. } => "earlyStop",
            OptimizationEvent::Error { .. } => "error",
        }
    }
}

/// Registry of progress subscribers keyed by job.
pub struct ProgressHub {
    subscribers: Mutex<HashMap<JobId, Vec<mpsc::Sender<OptimizationEvent>>>>,
    capacity: usize,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open a new stream for `job_id`. The stream ends after a final event
    /// or when the job's streams are closed.
    pub async fn subscribe(&self, job_id: JobId) -> mpsc::Receiver<OptimizationEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .await
            .entry(job_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Number of live subscribers for `job_id`.
    pub async fn subscriber_count(&self, job_id: JobId) -> usize {
        self.subscribers
            .lock()
            .await
            .get(&job_id)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Deliver `event` to every subscriber of `job_id`, in subscription
    /// order. Returns how many subscribers received it.
    ///
    /// A final event also closes the job's streams.
    pub async fn publish(&self, job_id: JobId, event: OptimizationEvent) -> usize {
        let senders = match self.subscribers.lock().await.get(&job_id) {
            Some(subs) => subs.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for tx in &senders {
            match tokio::time::timeout(SLOW_SUBSCRIBER_TIMEOUT, tx.send(event.clone())).await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(_)) => dead.push(tx.clone()),
                Err(_) => {
                    tracing::warn!(job_id = %job_id, "Dropping slow progress subscriber");
                    dead.push(tx.clone());
                }
            }
        }

        if event.is_final() {
            self.close(job_id).await;
        } else if !dead.is_empty() {
            let mut subs = self.subscribers.lock().await;
            if let Some(list) = subs.get_mut(&job_id) {
                list.retain(|tx| !dead.iter().any(|d| d.same_channel(tx)));
                if list.is_empty() {
                    subs.remove(&job_id);
                }
            }
        }

        delivered
    }

    /// End every stream for `job_id`.
    pub async fn close(&self, job_id: JobId) {
        self.subscribers.lock().await.remove(&job_id);
    }

    /// A cheap handle a job handler can publish through.
    pub fn sink(self: &Arc<Self>, job_id: JobId) -> ProgressSink {
        ProgressSink {
            hub: Arc::clone(self),
            job_id,
        }
    }
}

/// Publishing handle bound to a single job.
#[derive(Clone)]
pub struct ProgressSink {
    hub: Arc<ProgressHub>,
    job_id: JobId,
}

impl ProgressSink {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn emit(&self, event: OptimizationEvent) -> usize {
        self.hub.publish(self.job_id, event).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use quantgate_core::types::new_job_id;

    use super::*;

    fn evaluation(index: u64) -> OptimizationEvent {
        OptimizationEvent::Evaluation {
            index,
            params: BTreeMap::from([("fast".to_string(), index as f64)]),
            score: index as f64 / 10.0,
        }
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_order() {
        let hub = Arc::new(ProgressHub::default());
        let id = new_job_id();
        let mut rx = hub.subscribe(id).await;
        let sink = hub.sink(id);

        for i in 0..5 {
            assert_eq!(sink.emit(evaluation(i)).await, 1);
        }

        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(evaluation(i)));
        }
    }

    #[tokio::test]
    async fn final_event_closes_streams() {
        let hub = ProgressHub::default();
        let id = new_job_id();
        let mut rx = hub.subscribe(id).await;

        hub.publish(
            id,
            OptimizationEvent::EarlyStop {
                evaluations: 3,
                reason: "plateau".to_string(),
            },
        )
        .await;

        assert!(matches!(rx.recv().await, Some(OptimizationEvent::EarlyStop { .. })));
        assert_eq!(rx.recv().await, None);
        assert_eq!(hub.subscriber_count(id).await, 0);
    }

    #[tokio::test]
    async fn streams_are_isolated_per_job() {
        let hub = ProgressHub::default();
        let a = new_job_id();
        let b = new_job_id();
        let mut rx_a = hub.subscribe(a).await;
        let _rx_b = hub.subscribe(b).await;

        hub.publish(b, evaluation(1)).await;
        hub.publish(a, evaluation(2)).await;

        assert_eq!(rx_a.recv().await, Some(evaluation(2)));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let hub = ProgressHub::default();
        let id = new_job_id();
        let rx = hub.subscribe(id).await;
        let mut kept = hub.subscribe(id).await;
        drop(rx);

        assert_eq!(hub.publish(id, evaluation(0)).await, 1);
        assert_eq!(hub.subscriber_count(id).await, 1);
        assert_eq!(kept.recv().await, Some(evaluation(0)));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = ProgressHub::default();
        assert_eq!(hub.publish(new_job_id(), evaluation(0)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_subscriber_is_dropped_after_timeout() {
        let hub = ProgressHub::new(1);
        let id = new_job_id();
        let _stalled = hub.subscribe(id).await;

        assert_eq!(hub.publish(id, evaluation(0)).await, 1);
        // Channel is full and nobody reads: the publish waits out the timeout.
        assert_eq!(hub.publish(id, evaluation(1)).await, 0);
        assert_eq!(hub.subscriber_count(id).await, 0);
    }

    #[test]
    fn event_serializes_with_tag() {
        let value = serde_json::to_value(OptimizationEvent::Completed {
            evaluations: 6,
            best_params: BTreeMap::from([("slow".to_string(), 34.0)]),
            best_score: 1.7,
        })
        .unwrap();
        assert_eq!(value["event"], "completed");
        assert_eq!(value["bestScore"], 1.7);
    }

    #[test]
    fn name_matches_serialized_tag() {
        let early = OptimizationEvent::EarlyStop {
            evaluations: 3,
            reason: "no improvement".to_string(),
        };
        let value = serde_json::to_value(&early).unwrap();
        assert_eq!(value["event"], early.name());
    }
}
