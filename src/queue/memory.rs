//! In-process queue store.
//!
//! Holds every queue in a single mutex-protected map. Jobs do not survive a restart, so this
//! store backs tests and local runs; production deployments configure `REDIS_URL`.

use crate::queue::store::QueueStore;
use crate::queue::types::{
    ConversionJob, JobCounts, JobId, JobState, QueueError, QueueHandle, now_millis,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, ConversionJob>,
    pending: HashMap<String, VecDeque<JobId>>,
    queues: BTreeSet<String>,
}

impl MemoryState {
    fn job_mut(&mut self, id: JobId, expected: JobState) -> Result<&mut ConversionJob, QueueError> {
        let job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.state != expected {
            return Err(QueueError::InvalidState {
                id,
                state: job.state,
                expected,
            });
        }
        Ok(job)
    }

    fn unlink_pending(&mut self, queue: &str, id: JobId) {
        if let Some(pending) = self.pending.get_mut(queue) {
            pending.retain(|candidate| *candidate != id);
        }
    }
}

/// Queue store backed by process memory.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
}

impl MemoryQueueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn ensure_queue(&self, name: &str) -> Result<QueueHandle, QueueError> {
        let mut state = self.state.lock().await;
        if state.queues.insert(name.to_string()) {
            tracing::debug!(queue = name, "Queue created");
        }
        state.pending.entry(name.to_string()).or_default();
        Ok(QueueHandle {
            name: name.to_string(),
        })
    }

    async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.queues.iter().cloned().collect())
    }

    async fn enqueue(&self, mut job: ConversionJob) -> Result<JobId, QueueError> {
        let mut state = self.state.lock().await;
        let id = job.id;
        if let Some(previous) = state.jobs.remove(&id) {
            state.unlink_pending(&previous.queue, id);
        }
        job.state = JobState::Inactive;
        job.error = None;
        job.updated_at = now_millis();
        state.queues.insert(job.queue.clone());
        state
            .pending
            .entry(job.queue.clone())
            .or_default()
            .push_back(id);
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<ConversionJob>, QueueError> {
        let mut state = self.state.lock().await;
        loop {
            let Some(id) = state.pending.get_mut(queue).and_then(VecDeque::pop_front) else {
                return Ok(None);
            };
            if let Some(job) = state.jobs.get_mut(&id)
                && job.state == JobState::Inactive
            {
                job.state = JobState::Active;
                job.attempts += 1;
                job.updated_at = now_millis();
                return Ok(Some(job.clone()));
            }
        }
    }

    async fn touch(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id, JobState::Active)?;
        job.updated_at = now_millis();
        Ok(())
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.job_mut(id, JobState::Active)?;
        state.jobs.remove(&id);
        Ok(())
    }

    async fn fail(&self, id: JobId, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id, JobState::Active)?;
        job.state = JobState::Failed;
        job.error = Some(reason.to_string());
        job.updated_at = now_millis();
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<JobId>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Active)
            .map(|job| job.id)
            .collect())
    }

    async fn get(&self, id: JobId) -> Result<ConversionJob, QueueError> {
        let state = self.state.lock().await;
        state.jobs.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    async fn remove(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.remove(&id).ok_or(QueueError::NotFound(id))?;
        state.unlink_pending(&job.queue, id);
        Ok(())
    }

    async fn requeue(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id, JobState::Failed)?;
        job.state = JobState::Inactive;
        job.error = None;
        job.updated_at = now_millis();
        let queue = job.queue.clone();
        state.pending.entry(queue).or_default().push_back(id);
        Ok(())
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = JobCounts {
            queues: state.queues.len(),
            ..JobCounts::default()
        };
        for job in state.jobs.values() {
            match job.state {
                JobState::Inactive => counts.inactive += 1,
                JobState::Active => counts.active += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
