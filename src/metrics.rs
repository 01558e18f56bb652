use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing re-index activity since process start.
#[derive(Default)]
pub struct PipelineMetrics {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_reaped: AtomicU64,
    jobs_dead_lettered: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a run whose jobs were enqueued and whose consumers were started.
    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a run whose supervisor reached its target.
    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record jobs persisted in the queue store.
    pub fn record_enqueued(&self, count: u64) {
        self.jobs_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a job finished successfully by a worker.
    pub fn record_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job whose handler failed.
    pub fn record_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job force-removed by the watchdog.
    pub fn record_reaped(&self) {
        self.jobs_reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job moved to the failed state after repeated probe failures.
    pub fn record_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_reaped: self.jobs_reaped.load(Ordering::Relaxed),
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Runs kicked off since startup.
    pub runs_started: u64,
    /// Runs whose every job completed.
    pub runs_completed: u64,
    /// Conversion jobs (parent and child) written to the queue store.
    pub jobs_enqueued: u64,
    /// Jobs that finished successfully.
    pub jobs_completed: u64,
    /// Jobs whose handler reported a failure.
    pub jobs_failed: u64,
    /// Jobs removed by the stuck-job watchdog.
    pub jobs_reaped: u64,
    /// Jobs failed by the watchdog after repeated record fetch errors.
    pub jobs_dead_lettered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_job_lifecycle_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_run_started();
        metrics.record_enqueued(3);
        metrics.record_enqueued(2);
        metrics.record_completed();
        metrics.record_failed();
        metrics.record_reaped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_started, 1);
        assert_eq!(snapshot.runs_completed, 0);
        assert_eq!(snapshot.jobs_enqueued, 5);
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.jobs_reaped, 1);
        assert_eq!(snapshot.jobs_dead_lettered, 0);
    }

    #[test]
    fn snapshot_starts_empty() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
