//! Shutdown Supervisor: tracks per-run completions and signals when consumers may stop.

use crate::pipeline::types::RunTarget;
use crate::queue::JobId;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Progress of a run as seen by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Jobs are still outstanding.
    Running {
        /// Distinct jobs completed so far.
        completed: usize,
        /// Current target.
        expected: usize,
    },
    /// Every expected job completed.
    Completed {
        /// Final target, including child jobs.
        expected: usize,
    },
    /// Every expected job reached a terminal outcome but some did not complete.
    Settled {
        /// Distinct jobs completed.
        completed: usize,
        /// Jobs that failed or were reaped mid-flight.
        unfinished: usize,
        /// Final target, including child jobs.
        expected: usize,
    },
}

#[derive(Debug, Default)]
struct Progress {
    expected: usize,
    completed: HashSet<JobId>,
    failed: HashSet<JobId>,
    lost: HashSet<JobId>,
}

impl Progress {
    fn status(&self) -> RunStatus {
        let completed = self.completed.len();
        if completed >= self.expected {
            return RunStatus::Completed {
                expected: self.expected,
            };
        }
        let unfinished = self.failed.len() + self.lost.len();
        if completed + unfinished >= self.expected {
            RunStatus::Settled {
                completed,
                unfinished,
                expected: self.expected,
            }
        } else {
            RunStatus::Running {
                completed,
                expected: self.expected,
            }
        }
    }
}

/// Counts completions for one run and fires a one-shot signal once the run settles.
///
/// Completions are keyed by job id, so a job processed twice (requeued after a failure or
/// re-delivered after a reap) counts once. Completions from other runs are ignored.
#[derive(Debug)]
pub struct ShutdownSupervisor {
    run_id: Uuid,
    progress: Mutex<Progress>,
    settled: CancellationToken,
}

impl ShutdownSupervisor {
    /// Supervise `target`. A zero target settles immediately.
    pub fn new(target: RunTarget) -> Self {
        let supervisor = Self {
            run_id: target.run_id,
            progress: Mutex::new(Progress {
                expected: target.expected_total,
                ..Progress::default()
            }),
            settled: CancellationToken::new(),
        };
        if target.expected_total == 0 {
            tracing::info!(run_id = %target.run_id, "Run has no jobs; completing immediately");
            supervisor.settled.cancel();
        }
        supervisor
    }

    /// Run this supervisor belongs to.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Whether `run_id` is the supervised run.
    pub fn owns(&self, run_id: Uuid) -> bool {
        self.run_id == run_id
    }

    /// Raise the target by `count` jobs. Must be called before any of those jobs can complete.
    pub fn extend(&self, count: usize) {
        let mut progress = self.lock();
        progress.expected += count;
        tracing::debug!(run_id = %self.run_id, expected = progress.expected, "Run target extended");
    }

    /// Lower the target by `count` jobs that were announced but never enqueued.
    pub fn retract(&self, count: usize) {
        let mut progress = self.lock();
        progress.expected = progress.expected.saturating_sub(count);
        self.check(&progress);
    }

    /// Count a completed job. Returns `false` when the job was already counted.
    pub fn record_completion(&self, id: JobId) -> bool {
        let mut progress = self.lock();
        progress.failed.remove(&id);
        progress.lost.remove(&id);
        let counted = progress.completed.insert(id);
        self.check(&progress);
        counted
    }

    /// Note a job whose handler failed. A later completion of the same job supersedes it.
    pub fn record_failure(&self, id: JobId) {
        let mut progress = self.lock();
        if !progress.completed.contains(&id) {
            progress.failed.insert(id);
        }
        self.check(&progress);
    }

    /// Note a job that was removed from the store while its handler ran.
    pub fn record_lost(&self, id: JobId) {
        let mut progress = self.lock();
        if !progress.completed.contains(&id) {
            progress.lost.insert(id);
        }
        self.check(&progress);
    }

    /// Current progress.
    pub fn status(&self) -> RunStatus {
        self.lock().status()
    }

    /// Whether every expected job completed.
    pub fn is_complete(&self) -> bool {
        matches!(self.status(), RunStatus::Completed { .. })
    }

    /// Whether consumers of this run may stop.
    pub fn is_settled(&self) -> bool {
        self.settled.is_cancelled()
    }

    /// Resolve once the run settles.
    pub async fn settled(&self) {
        self.settled.cancelled().await;
    }

    /// Wait for the run to settle and report how it ended.
    pub async fn wait(&self) -> RunStatus {
        self.settled().await;
        self.status()
    }

    fn check(&self, progress: &Progress) {
        if self.settled.is_cancelled() {
            return;
        }
        match progress.status() {
            RunStatus::Completed { expected } => {
                tracing::info!(run_id = %self.run_id, expected, "Run completed; stopping consumers");
                self.settled.cancel();
            }
            RunStatus::Settled {
                completed,
                unfinished,
                expected,
            } => {
                tracing::warn!(
                    run_id = %self.run_id,
                    completed,
                    unfinished,
                    expected,
                    "Run settled with unfinished jobs; stopping consumers"
                );
                self.settled.cancel();
            }
            RunStatus::Running { .. } => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Supervisors of unsettled runs, keyed by run id.
///
/// Lets components outside a run (the watchdog) report jobs they removed, so a run whose
/// worker never returns still settles.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<Uuid, Weak<ShutdownSupervisor>>>,
}

impl RunRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `supervisor` until it settles or is dropped.
    pub fn register(&self, supervisor: &Arc<ShutdownSupervisor>) {
        let mut runs = self.lock();
        runs.retain(|_, run| run.upgrade().is_some_and(|run| !run.is_settled()));
        runs.insert(supervisor.run_id(), Arc::downgrade(supervisor));
    }

    /// Report `job` of `run_id` as lost. Returns `false` when no unsettled run matches.
    pub fn record_lost(&self, run_id: Uuid, job: JobId) -> bool {
        let supervisor = self.lock().get(&run_id).and_then(Weak::upgrade);
        match supervisor {
            Some(supervisor) if !supervisor.is_settled() => {
                supervisor.record_lost(job);
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Weak<ShutdownSupervisor>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
