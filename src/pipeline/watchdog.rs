//! Stuck-Job Watchdog: periodically removes active jobs that stopped reporting progress.

use crate::config::Config;
use crate::metrics::PipelineMetrics;
use crate::pipeline::supervisor::RunRegistry;
use crate::queue::{JobId, JobState, QueueError, QueueStore, now_millis};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Watchdog timing.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    /// Time between sweeps.
    pub interval: Duration,
    /// Maximum age of an active job's last update.
    pub stale_threshold: Duration,
    /// Consecutive record fetch failures before a job is moved to the failed state.
    pub max_fetch_failures: u32,
}

impl WatchdogSettings {
    /// Derive settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.watchdog_interval(),
            stale_threshold: config.watchdog_stale_threshold(),
            max_fetch_failures: config.watchdog_max_fetch_failures.max(1),
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
            stale_threshold: Duration::from_millis(2_000),
            max_fetch_failures: 3,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Active jobs listed at the start of the sweep.
    pub inspected: usize,
    /// Jobs removed for exceeding the threshold.
    pub reaped: usize,
    /// Jobs updated within the threshold.
    pub fresh: usize,
    /// Jobs that finished or disappeared between listing and inspection.
    pub vanished: usize,
    /// Jobs whose record could not be fetched this sweep.
    pub skipped: usize,
    /// Jobs moved to the failed state after repeated fetch failures.
    pub dead_lettered: usize,
}

/// Reaps stale active jobs from every queue of the store.
///
/// Reaping is unilateral: the worker holding the job is not notified. Its later completion
/// attempt finds the job gone and is not counted. When a [`RunRegistry`] is attached, the
/// reaped job's run learns of the reap immediately, so it settles even if that worker never
/// comes back.
pub struct StuckJobWatchdog {
    store: Arc<dyn QueueStore>,
    metrics: Arc<PipelineMetrics>,
    settings: WatchdogSettings,
    runs: Option<Arc<RunRegistry>>,
    fetch_failures: Mutex<HashMap<JobId, u32>>,
}

impl StuckJobWatchdog {
    /// Create a watchdog over `store`.
    pub fn new(
        store: Arc<dyn QueueStore>,
        metrics: Arc<PipelineMetrics>,
        settings: WatchdogSettings,
    ) -> Self {
        Self {
            store,
            metrics,
            settings,
            runs: None,
            fetch_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Report reaped jobs to the runs in `registry`.
    pub fn with_runs(mut self, registry: Arc<RunRegistry>) -> Self {
        self.runs = Some(registry);
        self
    }

    /// Sweep once using the current wall clock.
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        self.sweep_at(now_millis()).await
    }

    /// Sweep once as if the current time were `now` (milliseconds since the Unix epoch).
    ///
    /// A failure to list active jobs aborts the sweep; a failure to fetch one job skips only
    /// that job.
    pub async fn sweep_at(&self, now: i64) -> Result<SweepReport, QueueError> {
        let threshold = i64::try_from(self.settings.stale_threshold.as_millis()).unwrap_or(i64::MAX);
        let active = self.store.list_active().await?;
        let mut report = SweepReport {
            inspected: active.len(),
            ..SweepReport::default()
        };
        let mut failures = self.fetch_failures.lock().await;
        failures.retain(|id, _| active.contains(id));

        for id in active {
            let job = match self.store.get(id).await {
                Ok(job) => {
                    failures.remove(&id);
                    job
                }
                Err(QueueError::NotFound(_)) => {
                    failures.remove(&id);
                    report.vanished += 1;
                    continue;
                }
                Err(error) => {
                    let count = failures.entry(id).or_insert(0);
                    *count += 1;
                    tracing::warn!(
                        job_id = %id,
                        attempt = *count,
                        error = %error,
                        "Could not fetch active job; skipping"
                    );
                    if *count >= self.settings.max_fetch_failures {
                        failures.remove(&id);
                        self.dead_letter(id, &mut report).await;
                    } else {
                        report.skipped += 1;
                    }
                    continue;
                }
            };

            if job.state != JobState::Active {
                report.vanished += 1;
                continue;
            }
            let age = now - job.updated_at;
            if age <= threshold {
                report.fresh += 1;
                continue;
            }
            match self.store.remove(id).await {
                Ok(()) => {
                    self.metrics.record_reaped();
                    report.reaped += 1;
                    tracing::warn!(
                        job_id = %id,
                        queue = %job.queue,
                        document_id = %job.payload.document_id,
                        age_ms = age,
                        threshold_ms = threshold,
                        "Removed stuck job"
                    );
                    if let Some(runs) = &self.runs
                        && runs.record_lost(job.run_id, id)
                    {
                        tracing::debug!(job_id = %id, run_id = %job.run_id, "Run notified of reap");
                    }
                }
                Err(QueueError::NotFound(_)) => report.vanished += 1,
                Err(error) => {
                    report.skipped += 1;
                    tracing::warn!(job_id = %id, error = %error, "Failed to remove stuck job");
                }
            }
        }

        tracing::debug!(
            inspected = report.inspected,
            reaped = report.reaped,
            fresh = report.fresh,
            skipped = report.skipped,
            dead_lettered = report.dead_lettered,
            "Watchdog sweep finished"
        );
        Ok(report)
    }

    /// Sweep every interval until `shutdown` is cancelled. The first sweep runs one interval
    /// after start.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            tracing::info!(
                interval_ms = self.settings.interval.as_millis() as u64,
                threshold_ms = self.settings.stale_threshold.as_millis() as u64,
                "Stuck-job watchdog started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = self.sweep().await {
                            tracing::warn!(error = %error, "Watchdog sweep failed");
                        }
                    }
                }
            }
            tracing::info!("Stuck-job watchdog stopped");
        })
    }

    async fn dead_letter(&self, id: JobId, report: &mut SweepReport) {
        let reason = format!(
            "Dead-lettered after {} consecutive record fetch failures",
            self.settings.max_fetch_failures
        );
        match self.store.fail(id, &reason).await {
            Ok(()) => {
                self.metrics.record_dead_lettered();
                report.dead_lettered += 1;
                tracing::warn!(job_id = %id, "Moved unreadable job to the failed state");
            }
            Err(error) => {
                report.skipped += 1;
                tracing::warn!(job_id = %id, error = %error, "Failed to dead-letter job");
            }
        }
    }
}
