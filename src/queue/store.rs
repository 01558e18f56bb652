//! Queue store abstraction.

use crate::queue::types::{ConversionJob, JobCounts, JobId, QueueError, QueueHandle};
use async_trait::async_trait;

/// Operations every queue backend offers. The store is the only shared mutable resource of
/// the pipeline; components touch jobs exclusively through these calls.
///
/// `claim_next` hands a job to at most one caller at a time. Completed jobs are removed.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Resolve a named queue, creating it when missing. Idempotent.
    async fn ensure_queue(&self, name: &str) -> Result<QueueHandle, QueueError>;

    /// Names of every known queue, sorted.
    async fn list_queues(&self) -> Result<Vec<String>, QueueError>;

    /// Persist a job at the tail of its queue in the inactive state.
    ///
    /// Enqueuing an identity that already exists replaces the stored record, so a reaped or
    /// failed job can be re-enqueued without duplicating it.
    async fn enqueue(&self, job: ConversionJob) -> Result<JobId, QueueError>;

    /// Claim the oldest inactive job of a queue, marking it active.
    async fn claim_next(&self, queue: &str) -> Result<Option<ConversionJob>, QueueError>;

    /// Refresh `updated_at` of an active job.
    async fn touch(&self, id: JobId) -> Result<(), QueueError>;

    /// Remove an active job after successful processing.
    async fn complete(&self, id: JobId) -> Result<(), QueueError>;

    /// Move an active job to the failed state with a reason.
    async fn fail(&self, id: JobId, reason: &str) -> Result<(), QueueError>;

    /// Identifiers of every active job.
    async fn list_active(&self) -> Result<Vec<JobId>, QueueError>;

    /// Fetch a job record.
    async fn get(&self, id: JobId) -> Result<ConversionJob, QueueError>;

    /// Delete a job regardless of its state.
    async fn remove(&self, id: JobId) -> Result<(), QueueError>;

    /// Put a failed job back at the tail of its queue under the same identity.
    async fn requeue(&self, id: JobId) -> Result<(), QueueError>;

    /// Per-state totals.
    async fn counts(&self) -> Result<JobCounts, QueueError>;
}
