//! Quantgate admission-control and scheduling engine.
//!
//! - [`AdmissionController`]: synchronous admit/reject against queue depth,
//!   deadlines, id uniqueness and optional per-source fairness.
//! - [`JobQueue`]: three strict-priority lanes.
//! - [`ResourceMonitor`]: periodic CPU / memory sampling, fail-closed.
//! - [`WorkerPool`]: autoscaled Tokio worker tasks running pluggable
//!   [`JobHandler`]s.
//! - [`RetryManager`]: exponential backoff re-admission.
//! - [`Dispatcher`]: the scheduler tick loop.
//! - [`Controller`]: the public facade tying them together.

pub mod admission;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod fairness;
pub mod handler;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod record;
pub mod resources;
pub mod retry;
pub mod settings;
pub mod store;

pub use admission::AdmissionController;
pub use controller::{Controller, EngineStatus, KindCounts, ResourceView};
pub use dispatcher::Dispatcher;
pub use error::{AdmissionError, HandlerError, ProbeError};
pub use handler::{HandlerRegistry, JobContext, JobHandler};
pub use metrics::EngineMetrics;
pub use pool::WorkerPool;
pub use queue::JobQueue;
pub use resources::{ManualProbe, ProcProbe, ResourceMonitor, ResourceProbe, ResourceSample};
pub use retry::RetryManager;
pub use settings::{EngineSettings, FairnessConfig};
pub use store::{InMemoryJobStore, JobStore};
