//! Quantgate event infrastructure.
//!
//! - [`EventBus`]: in-process publish/subscribe hub for job lifecycle
//!   events, backed by `tokio::sync::broadcast`.
//! - [`JobEvent`]: the lifecycle event envelope.
//! - [`ProgressHub`]: ordered, bounded per-job streams of
//!   [`OptimizationEvent`]s.

pub mod bus;
pub mod progress;

pub use bus::{EventBus, JobEvent, JobEventType};
pub use progress::{OptimizationEvent, ProgressHub, ProgressSink};
