//! Job worker metrics
//!
//! Emits through the `metrics` facade; installing a recorder/exporter is up to
//! the host application. `WorkerStats` keeps the same counts in process.

use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Job worker metrics helper
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Job type for labeling
    job_type: String,
    /// Worker name for labeling
    worker: String,
    stats: std::sync::Arc<WorkerStats>,
}

impl WorkerMetrics {
    pub fn new(job_type: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            worker: worker.into(),
            stats: Default::default(),
        }
    }

    /// Record a job accepted into the local buffer
    pub fn job_activated(&self) {
        self.stats.activated.fetch_add(1, Ordering::Relaxed);
        counter!(
            "job_worker_jobs_activated_total",
            "job_type" => self.job_type.clone(),
            "worker" => self.worker.clone()
        )
        .increment(1);
    }

    /// Record a job whose handling finished, whatever the outcome
    pub fn job_handled(&self, duration: Duration) {
        self.stats.handled.fetch_add(1, Ordering::Relaxed);
        counter!(
            "job_worker_jobs_handled_total",
            "job_type" => self.job_type.clone(),
            "worker" => self.worker.clone()
        )
        .increment(1);

        histogram!(
            "job_worker_job_duration_seconds",
            "job_type" => self.job_type.clone(),
            "worker" => self.worker.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a handler error or panic turned into a fail command
    pub fn job_failed(&self, reason: &'static str) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        counter!(
            "job_worker_jobs_failed_total",
            "job_type" => self.job_type.clone(),
            "worker" => self.worker.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record a job abandoned because the buffer stayed full
    pub fn job_dropped(&self) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        counter!(
            "job_worker_jobs_dropped_total",
            "job_type" => self.job_type.clone(),
            "worker" => self.worker.clone()
        )
        .increment(1);
    }

    /// Update current buffer occupancy
    pub fn set_queue_occupancy(&self, size: usize) {
        gauge!(
            "job_worker_queue_occupancy",
            "job_type" => self.job_type.clone(),
            "worker" => self.worker.clone()
        )
        .set(size as f64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// In-process counters mirroring the emitted metrics
#[derive(Debug, Default)]
pub struct WorkerStats {
    activated: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            activated: self.activated.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub activated: u64,
    pub handled: u64,
    pub failed: u64,
    pub dropped: u64,
}
