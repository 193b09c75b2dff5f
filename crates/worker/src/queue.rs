//! Three-lane strict-priority job queue.
//!
//! Lanes drain high before normal before low, FIFO within a lane. The queue
//! itself is not synchronized: the engine wraps it in a single mutex so that
//! every push, pop and removal is one atomic step.

use std::collections::VecDeque;

use quantgate_core::job::{Job, JobPriority, JobStatus};
use quantgate_core::types::{JobId, Timestamp};

/// Error recorded on jobs discarded because their deadline passed in queue.
pub const DEADLINE_PASSED: &str = "deadline passed before dispatch";

/// Error recorded on jobs evicted for waiting longer than the queue-wait limit.
pub const QUEUE_WAIT_EXCEEDED: &str = "queue wait limit exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Queue is full ({depth}/{max})")]
pub struct QueueFull {
    pub depth: usize,
    pub max: usize,
}

/// Result of [`JobQueue::pop`].
#[derive(Debug, Default)]
pub struct Popped {
    /// The next eligible job, if any.
    pub job: Option<Job>,
    /// Jobs discarded along the way, already marked expired.
    pub expired: Vec<Job>,
}

#[derive(Debug)]
pub struct JobQueue {
    lanes: [VecDeque<Job>; 3],
    max_depth: usize,
}

impl JobQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn is_full(&self) -> bool {
        self.depth() >= self.max_depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn lane_depth(&self, priority: JobPriority) -> usize {
        self.lanes[priority.lane()].len()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.lanes.iter().flatten().any(|job| job.id == id)
    }

    /// Append to the back of the job's priority lane.
    pub fn push(&mut self, job: Job) -> Result<(), QueueFull> {
        let depth = self.depth();
        if depth >= self.max_depth {
            return Err(QueueFull {
                depth,
                max: self.max_depth,
            });
        }
        self.lanes[job.priority.lane()].push_back(job);
        Ok(())
    }

    /// Put a just-popped job back at the head of its lane.
    ///
    /// Used when a hand-off fails after the pop; the slot it occupied is
    /// still free so the depth limit is not rechecked.
    pub fn push_front(&mut self, job: Job) {
        self.lanes[job.priority.lane()].push_front(job);
    }

    /// Take the highest-priority job whose deadline has not passed.
    ///
    /// Jobs past their deadline that are encountered first are removed and
    /// returned in [`Popped::expired`] with status `expired`.
    pub fn pop(&mut self, now: Timestamp) -> Popped {
        let mut popped = Popped::default();
        for lane in self.lanes.iter_mut() {
            while let Some(mut job) = lane.pop_front() {
                if job.is_past_deadline(now) {
                    job.finish(JobStatus::Expired, Some(DEADLINE_PASSED.to_string()));
                    popped.expired.push(job);
                    continue;
                }
                popped.job = Some(job);
                return popped;
            }
        }
        popped
    }

    /// Remove a still-queued job, e.g. on cancellation.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        for lane in self.lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|job| job.id == id) {
                return lane.remove(pos);
            }
        }
        None
    }

    /// Remove every job that has waited longer than `limit`, marking each
    /// expired. Order within the result follows lane order.
    pub fn evict_stale(&mut self, now: Timestamp, limit: chrono::Duration) -> Vec<Job> {
        self.drain_where(|job| job.queue_wait(now) > limit, QUEUE_WAIT_EXCEEDED)
    }

    /// Remove every job whose deadline has passed, wherever it sits in its
    /// lane, marking each expired.
    pub fn expire_past_deadline(&mut self, now: Timestamp) -> Vec<Job> {
        self.drain_where(|job| job.is_past_deadline(now), DEADLINE_PASSED)
    }

    fn drain_where(&mut self, expired: impl Fn(&Job) -> bool, reason: &str) -> Vec<Job> {
        let mut removed = Vec::new();
        for lane in self.lanes.iter_mut() {
            if !lane.iter().any(&expired) {
                continue;
            }
            let mut kept = VecDeque::with_capacity(lane.len());
            for mut job in lane.drain(..) {
                if expired(&job) {
                    job.finish(JobStatus::Expired, Some(reason.to_string()));
                    removed.push(job);
                } else {
                    kept.push_back(job);
                }
            }
            *lane = kept;
        }
        removed
    }

    /// Ids in dispatch order.
    pub fn ids(&self) -> Vec<JobId> {
        self.lanes.iter().flatten().map(|job| job.id).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};
    use quantgate_core::job::JobRequest;
    use quantgate_core::payload::{JobPayload, LivePayload};

    use super::*;

    fn job(priority: JobPriority) -> Job {
        JobRequest::new(JobPayload::Live(LivePayload {
            strategy_id: "grid".to_string(),
            symbol: "ETHUSDT".to_string(),
            exchange: "binance".to_string(),
        }))
        .with_priority(priority)
        .into_job(Utc::now())
        .unwrap()
    }

    #[test]
    fn drains_lanes_in_strict_priority_order() {
        let mut queue = JobQueue::new(10);
        let low = job(JobPriority::Low);
        let normal = job(JobPriority::Normal);
        let high = job(JobPriority::High);
        let (low_id, normal_id, high_id) = (low.id, normal.id, high.id);
        queue.push(low).unwrap();
        queue.push(normal).unwrap();
        queue.push(high).unwrap();

        let now = Utc::now();
        assert_eq!(queue.pop(now).job.map(|j| j.id), Some(high_id));
        assert_eq!(queue.pop(now).job.map(|j| j.id), Some(normal_id));
        assert_eq!(queue.pop(now).job.map(|j| j.id), Some(low_id));
        assert!(queue.pop(now).job.is_none());
    }

    #[test]
    fn fifo_within_a_lane() {
        let mut queue = JobQueue::new(10);
        let first = job(JobPriority::Normal);
        let second = job(JobPriority::Normal);
        let ids = vec![first.id, second.id];
        queue.push(first).unwrap();
        queue.push(second).unwrap();
        assert_eq!(queue.ids(), ids);
    }

    #[test]
    fn push_fails_when_full() {
        let mut queue = JobQueue::new(2);
        queue.push(job(JobPriority::Low)).unwrap();
        queue.push(job(JobPriority::Low)).unwrap();
        assert_matches!(
            queue.push(job(JobPriority::High)),
            Err(QueueFull { depth: 2, max: 2 })
        );
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn pop_discards_jobs_past_deadline() {
        let mut queue = JobQueue::new(10);
        let mut stale = job(JobPriority::High);
        stale.deadline = Utc::now() - Duration::seconds(1);
        let stale_id = stale.id;
        let fresh = job(JobPriority::Low);
        let fresh_id = fresh.id;
        queue.push(stale).unwrap();
        queue.push(fresh).unwrap();

        let popped = queue.pop(Utc::now());
        assert_eq!(popped.job.map(|j| j.id), Some(fresh_id));
        assert_eq!(popped.expired.len(), 1);
        assert_eq!(popped.expired[0].id, stale_id);
        assert_eq!(popped.expired[0].status, JobStatus::Expired);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_takes_job_out_of_its_lane() {
        let mut queue = JobQueue::new(10);
        let a = job(JobPriority::Normal);
        let b = job(JobPriority::Normal);
        let a_id = a.id;
        queue.push(a).unwrap();
        queue.push(b).unwrap();

        assert_eq!(queue.remove(a_id).map(|j| j.id), Some(a_id));
        assert!(queue.remove(a_id).is_none());
        assert!(!queue.contains(a_id));
        assert_eq!(queue.lane_depth(JobPriority::Normal), 1);
    }

    #[test]
    fn evict_stale_uses_enqueue_time() {
        let mut queue = JobQueue::new(10);
        let mut old = job(JobPriority::Normal);
        old.enqueued_at = Utc::now() - Duration::seconds(30);
        let old_id = old.id;
        queue.push(old).unwrap();
        queue.push(job(JobPriority::Normal)).unwrap();

        let evicted = queue.evict_stale(Utc::now(), Duration::seconds(10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, old_id);
        assert_eq!(evicted[0].error.as_deref(), Some(QUEUE_WAIT_EXCEEDED));
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn expire_past_deadline_reaches_behind_the_head() {
        let mut queue = JobQueue::new(10);
        let head = job(JobPriority::Normal);
        let mut doomed = job(JobPriority::Normal);
        doomed.deadline = Utc::now() - Duration::milliseconds(5);
        let (head_id, doomed_id) = (head.id, doomed.id);
        queue.push(head).unwrap();
        queue.push(doomed).unwrap();
        queue.push(job(JobPriority::Low)).unwrap();

        let expired = queue.expire_past_deadline(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, doomed_id);
        assert_eq!(expired[0].status, JobStatus::Expired);
        assert_eq!(expired[0].error.as_deref(), Some(DEADLINE_PASSED));
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.ids()[0], head_id);
    }

    #[test]
    fn push_front_restores_head_position() {
        let mut queue = JobQueue::new(10);
        let a = job(JobPriority::Normal);
        let a_id = a.id;
        queue.push(a).unwrap();
        queue.push(job(JobPriority::Normal)).unwrap();

        let popped = queue.pop(Utc::now()).job.unwrap();
        queue.push_front(popped);
        assert_eq!(queue.ids()[0], a_id);
    }
}
