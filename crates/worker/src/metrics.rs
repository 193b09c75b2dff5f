//! Lock-free engine counters and their text exposition.
//!
//! Counters are fixed arrays of atomics indexed by kind, status or
//! rejection reason, so recording never takes a lock. Gauges are not stored
//! here: they are read from the live engine when rendering.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use quantgate_core::job::{JobKind, JobStatus};
use quantgate_core::metric_names::{
    METRIC_CPU_PERCENT, METRIC_JOBS_TOTAL, METRIC_JOB_RUNTIME_MS, METRIC_MEMORY_PERCENT,
    METRIC_QUEUE_DEPTH, METRIC_QUEUE_WAIT_EXCEEDED, METRIC_REJECTIONS_TOTAL,
    METRIC_RETRIES_TOTAL, METRIC_SAMPLE_FAILURES, METRIC_STEP_LATENCY_EXCEEDED, METRIC_WORKERS,
    METRIC_WORKERS_RUNNING, REASON_BACKPRESSURE, REASON_DUPLICATE, REASON_EXPIRED,
    REASON_FAIRNESS, REASON_VALIDATION,
};

const KINDS: usize = JobKind::ALL.len();
const STATUSES: usize = JobStatus::ALL.len();

/// Every rejection reason label, in exposition order.
pub const REJECTION_REASONS: [&str; 5] = [
    REASON_BACKPRESSURE,
    REASON_FAIRNESS,
    REASON_VALIDATION,
    REASON_EXPIRED,
    REASON_DUPLICATE,
];

/// Point-in-time gauge values supplied by the engine at render time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub queue_depth: usize,
    pub workers: usize,
    pub workers_running: usize,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

pub struct EngineMetrics {
    jobs: [[AtomicU64; STATUSES]; KINDS],
    rejections: [AtomicU64; REJECTION_REASONS.len()],
    retries: [AtomicU64; KINDS],
    step_latency_exceeded: [AtomicU64; KINDS],
    runtime_ms_sum: [AtomicU64; KINDS],
    runtime_count: [AtomicU64; KINDS],
    queue_wait_exceeded: AtomicU64,
    sample_failures: AtomicU64,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_index(kind: JobKind) -> usize {
    JobKind::ALL.iter().position(|k| *k == kind).unwrap_or(0)
}

fn status_index(status: JobStatus) -> usize {
    JobStatus::ALL.iter().position(|s| *s == status).unwrap_or(0)
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            jobs: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
            rejections: std::array::from_fn(|_| AtomicU64::new(0)),
            retries: std::array::from_fn(|_| AtomicU64::new(0)),
            step_latency_exceeded: std::array::from_fn(|_| AtomicU64::new(0)),
            runtime_ms_sum: std::array::from_fn(|_| AtomicU64::new(0)),
            runtime_count: std::array::from_fn(|_| AtomicU64::new(0)),
            queue_wait_exceeded: AtomicU64::new(0),
            sample_failures: AtomicU64::new(0),
        }
    }

    // -- recording --------------------------------------------------------

    /// Count a job entering `status`.
    pub fn job_transition(&self, kind: JobKind, status: JobStatus) {
        self.jobs[kind_index(kind)][status_index(status)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejection(&self, reason: &str) {
        if let Some(i) = REJECTION_REASONS.iter().position(|r| *r == reason) {
            self.rejections[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn retry_scheduled(&self, kind: JobKind) {
        self.retries[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_latency_exceeded(&self, kind: JobKind) {
        self.step_latency_exceeded[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_runtime(&self, kind: JobKind, elapsed: Duration) {
        let i = kind_index(kind);
        self.runtime_ms_sum[i].fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.runtime_count[i].fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_wait_exceeded(&self) {
        self.queue_wait_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample_failure(&self) {
        self.sample_failures.fetch_add(1, Ordering::Relaxed);
    }

    // -- reading ----------------------------------------------------------

    pub fn jobs_total(&self, kind: JobKind, status: JobStatus) -> u64 {
        self.jobs[kind_index(kind)][status_index(status)].load(Ordering::Relaxed)
    }

    pub fn rejections(&self, reason: &str) -> u64 {
        REJECTION_REASONS
            .iter()
            .position(|r| *r == reason)
            .map(|i| self.rejections[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn retries(&self, kind: JobKind) -> u64 {
        self.retries[kind_index(kind)].load(Ordering::Relaxed)
    }

    pub fn queue_wait_exceeded_total(&self) -> u64 {
        self.queue_wait_exceeded.load(Ordering::Relaxed)
    }

    pub fn step_latency_exceeded_total(&self, kind: JobKind) -> u64 {
        self.step_latency_exceeded[kind_index(kind)].load(Ordering::Relaxed)
    }

    pub fn sample_failures(&self) -> u64 {
        self.sample_failures.load(Ordering::Relaxed)
    }

    /// Render counters and the given gauges in Prometheus text format.
    pub fn render(&self, gauges: &Gauges) -> String {
        let mut out = String::new();

        gauge(&mut out, METRIC_QUEUE_DEPTH, "Jobs waiting in the queue", gauges.queue_depth as f64);
        gauge(&mut out, METRIC_WORKERS, "Workers alive in the pool", gauges.workers as f64);
        gauge(
            &mut out,
            METRIC_WORKERS_RUNNING,
            "Workers currently executing a job",
            gauges.workers_running as f64,
        );
        gauge(&mut out, METRIC_CPU_PERCENT, "Latest sampled CPU utilisation", gauges.cpu_percent);
        gauge(
            &mut out,
            METRIC_MEMORY_PERCENT,
            "Latest sampled memory as a percent of the limit",
            gauges.memory_percent,
        );

        header(&mut out, METRIC_JOBS_TOTAL, "Job state transitions", "counter");
        for kind in JobKind::ALL {
            for status in JobStatus::ALL {
                let _ = writeln!(
                    out,
                    "{METRIC_JOBS_TOTAL}{{kind=\"{kind}\",status=\"{status}\"}} {}",
                    self.jobs_total(kind, status)
                );
            }
        }

        header(&mut out, METRIC_REJECTIONS_TOTAL, "Admissions refused", "counter");
        for reason in REJECTION_REASONS {
            let _ = writeln!(
                out,
                "{METRIC_REJECTIONS_TOTAL}{{reason=\"{reason}\"}} {}",
                self.rejections(reason)
            );
        }

        header(&mut out, METRIC_RETRIES_TOTAL, "Retries scheduled", "counter");
        for kind in JobKind::ALL {
            let _ = writeln!(out, "{METRIC_RETRIES_TOTAL}{{kind=\"{kind}\"}} {}", self.retries(kind));
        }

        header(
            &mut out,
            METRIC_STEP_LATENCY_EXCEEDED,
            "Executions slower than the step latency limit",
            "counter",
        );
        for kind in JobKind::ALL {
            let _ = writeln!(
                out,
                "{METRIC_STEP_LATENCY_EXCEEDED}{{kind=\"{kind}\"}} {}",
                self.step_latency_exceeded_total(kind)
            );
        }

        header(&mut out, METRIC_JOB_RUNTIME_MS, "Job execution time", "summary");
        for kind in JobKind::ALL {
            let i = kind_index(kind);
            let _ = writeln!(
                out,
                "{METRIC_JOB_RUNTIME_MS}_sum{{kind=\"{kind}\"}} {}",
                self.runtime_ms_sum[i].load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "{METRIC_JOB_RUNTIME_MS}_count{{kind=\"{kind}\"}} {}",
                self.runtime_count[i].load(Ordering::Relaxed)
            );
        }

        header(
            &mut out,
            METRIC_QUEUE_WAIT_EXCEEDED,
            "Jobs evicted for waiting too long in the queue",
            "counter",
        );
        let _ = writeln!(out, "{METRIC_QUEUE_WAIT_EXCEEDED} {}", self.queue_wait_exceeded_total());

        header(&mut out, METRIC_SAMPLE_FAILURES, "Failed resource samples", "counter");
        let _ = writeln!(out, "{METRIC_SAMPLE_FAILURES} {}", self.sample_failures());

        out
    }
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    header(out, name, help, "gauge");
    let _ = writeln!(out, "{name} {value}");
}
