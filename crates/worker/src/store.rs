//! Job lookup capability.
//!
//! The engine only needs `get`, `put` and `list`; persistence can be
//! swapped without touching scheduling logic.

use std::collections::HashMap;

use async_trait::async_trait;
use quantgate_core::job::Job;
use quantgate_core::types::JobId;
use tokio::sync::RwLock;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: JobId) -> Option<Job>;

    /// Insert or replace the job with the same id.
    async fn put(&self, job: Job);

    /// All jobs, oldest first.
    async fn list(&self) -> Vec<Job>;
}

/// Process-local store backed by a `HashMap`.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.read().await.get(&id).cloned()
    }

    async fn put(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }

    async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use quantgate_core::job::{JobRequest, JobStatus};
    use quantgate_core::payload::{JobPayload, PaperPayload};

    use super::*;

    fn job() -> Job {
        JobRequest::new(JobPayload::Paper(PaperPayload {
            strategy_id: "mean-revert".to_string(),
            symbol: "SOLUSDT".to_string(),
            initial_balance: 1_000.0,
        }))
        .into_job(Utc::now())
        .unwrap()
    }

    #[tokio::test]
    async fn put_replaces_existing_entry() {
        let store = InMemoryJobStore::new();
        let mut job = job();
        store.put(job.clone()).await;

        job.status = JobStatus::Running;
        store.put(job.clone()).await;

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_none() {
        let store = InMemoryJobStore::new();
        assert!(store.get(quantgate_core::types::new_job_id()).await.is_none());
    }

    #[tokio::test]
    async fn list_is_ordered_by_creation() {
        let store = InMemoryJobStore::new();
        let mut first = job();
        first.created_at = Utc::now() - chrono::Duration::seconds(5);
        let second = job();
        store.put(second.clone()).await;
        store.put(first.clone()).await;

        let ids: Vec<_> = store.list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
