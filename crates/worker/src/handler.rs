//! Pluggable per-kind job handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use quantgate_core::job::{Job, JobKind};
use quantgate_events::{OptimizationEvent, ProgressSink};
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;

/// Everything a handler gets for one attempt.
pub struct JobContext {
    pub job: Job,
    cancel: CancellationToken,
    progress: ProgressSink,
}

impl JobContext {
    pub(crate) fn new(job: Job, cancel: CancellationToken, progress: ProgressSink) -> Self {
        Self {
            job,
            cancel,
            progress,
        }
    }

    /// Cancellation is cooperative: handlers poll this (or await
    /// [`cancelled`](Self::cancelled)) at convenient points.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Publish an optimization progress event to this job's subscribers.
    /// Waits while a subscriber's buffer is full.
    pub async fn emit(&self, event: OptimizationEvent) {
        self.progress.emit(event).await;
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError>;
}

/// Handlers keyed by [`JobKind`].
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: JobKind, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Register the same handler for every kind.
    pub fn register_all(mut self, handler: Arc<dyn JobHandler>) -> Self {
        for kind in JobKind::ALL {
            self.handlers.insert(kind, Arc::clone(&handler));
        }
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
