//! Well-known metric names for the `/optimizer/metrics` text exposition.
//!
//! Shared by the engine (which records them) and the HTTP layer (which
//! serves them), so dashboards and alerts can rely on stable names.

/// Gauge: jobs currently waiting in the queue.
pub const METRIC_QUEUE_DEPTH: &str = "quantgate_queue_depth";

/// Gauge: workers currently alive in the pool.
pub const METRIC_WORKERS: &str = "quantgate_workers";

/// Gauge: workers currently executing a job.
pub const METRIC_WORKERS_RUNNING: &str = "quantgate_workers_running";

/// Gauge: latest sampled CPU utilisation, percent.
pub const METRIC_CPU_PERCENT: &str = "quantgate_cpu_percent";

/// Gauge: latest sampled memory usage as a percent of `memoryLimitMB`.
pub const METRIC_MEMORY_PERCENT: &str = "quantgate_memory_percent";

/// Counter: job state transitions, labelled by `kind` and `status`.
pub const METRIC_JOBS_TOTAL: &str = "quantgate_jobs_total";

/// Counter: admissions refused, labelled by `reason`.
pub const METRIC_REJECTIONS_TOTAL: &str = "quantgate_rejections_total";

/// Counter: retries scheduled, labelled by `kind`.
pub const METRIC_RETRIES_TOTAL: &str = "quantgate_retries_total";

/// Counter: jobs evicted for exceeding `queueWaitLimitMs`.
pub const METRIC_QUEUE_WAIT_EXCEEDED: &str = "quantgate_queue_wait_exceeded_total";

/// Counter: executions that exceeded `stepLatencyLimitMs`, labelled by `kind`.
pub const METRIC_STEP_LATENCY_EXCEEDED: &str = "quantgate_step_latency_exceeded_total";

/// Summary parts: job runtime in milliseconds, labelled by `kind`.
pub const METRIC_JOB_RUNTIME_MS: &str = "quantgate_job_runtime_ms";

/// Counter: resource samples that failed (treated as over limit).
pub const METRIC_SAMPLE_FAILURES: &str = "quantgate_resource_sample_failures_total";

/// Rejection reason labels.
pub const REASON_BACKPRESSURE: &str = "backpressure";
pub const REASON_FAIRNESS: &str = "fairness";
pub const REASON_VALIDATION: &str = "validation";
pub const REASON_EXPIRED: &str = "expired";
pub const REASON_DUPLICATE: &str = "duplicate";
