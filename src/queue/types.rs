//! Job records, queue handles, and errors shared by every queue store.

use crate::pipeline::types::{CHILD_QUEUE_SUFFIX, FormattedRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Identity of a job. Stable across reaps and operator requeues.
pub type JobId = Uuid;

/// Errors returned by queue stores.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store rejected the command or could not be reached.
    #[error("Queue store request failed: {0}")]
    Backend(#[from] redis::RedisError),
    /// No job exists under the identifier.
    #[error("Job not found: {0}")]
    NotFound(JobId),
    /// The job exists but is not in a state that allows the operation.
    #[error("Job {id} is {state:?}; expected {expected:?}")]
    InvalidState {
        /// Job that was addressed.
        id: JobId,
        /// State the job is in.
        state: JobState,
        /// State the operation requires.
        expected: JobState,
    },
    /// A stored record could not be encoded or decoded.
    #[error("Corrupt job record: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        Self::Corrupt(error.to_string())
    }
}

/// Lifecycle state of a stored job. Completed and reaped jobs are removed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in its queue.
    Inactive,
    /// Claimed by a worker.
    Active,
    /// The handler failed or the job was dead-lettered.
    Failed,
}

impl JobState {
    /// Wire representation used by persistent stores.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    /// Parse the wire representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inactive" => Some(Self::Inactive),
            "active" => Some(Self::Active),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Distinguishes parent conversions from conversions of nested child records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// One record of a formatted batch.
    Conversion,
    /// A nested record spawned while processing `parent`.
    ChildConversion {
        /// Job whose processing produced this one.
        parent: JobId,
    },
}

/// Resolved named queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct QueueHandle {
    /// Queue name, deterministic for a (collection, category) pair.
    pub name: String,
}

impl QueueHandle {
    /// Whether the queue carries child conversion jobs.
    pub fn is_child_queue(&self) -> bool {
        is_child_queue(&self.name)
    }
}

/// Queue name for a (collection, category) pair.
///
/// `:` is reserved for the child-queue suffix and is replaced by `_` in both parts, so a
/// parent queue name never looks like a child queue.
pub fn queue_name(collection: &str, category: &str) -> String {
    format!("{}-{}", queue_segment(collection), queue_segment(category))
}

fn queue_segment(value: &str) -> String {
    value.replace(':', "_")
}

/// Child-job queue paired with a parent queue.
pub fn child_queue_name(parent_queue: &str) -> String {
    format!("{parent_queue}{CHILD_QUEUE_SUFFIX}")
}

/// Whether a queue name belongs to the child-job namespace.
pub fn is_child_queue(name: &str) -> bool {
    name.ends_with(CHILD_QUEUE_SUFFIX)
}

/// Unit of work stored in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    /// Job identity.
    pub id: JobId,
    /// Run that enqueued the job.
    pub run_id: Uuid,
    /// Queue the job lives in.
    pub queue: String,
    /// Offset of the record within its batch (or within its parent for children).
    pub index: usize,
    /// Parent or child conversion.
    pub kind: JobKind,
    /// Record to ingest.
    pub payload: FormattedRecord,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Last self-reported update, milliseconds since the Unix epoch.
    pub updated_at: i64,
    /// Failure reason for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConversionJob {
    /// Build a pending job with a fresh identity.
    pub fn new(
        run_id: Uuid,
        queue: impl Into<String>,
        index: usize,
        kind: JobKind,
        payload: FormattedRecord,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            run_id,
            queue: queue.into(),
            index,
            kind,
            payload,
            state: JobState::Inactive,
            attempts: 0,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Whether this job converts a nested child record.
    pub fn is_child(&self) -> bool {
        matches!(self.kind, JobKind::ChildConversion { .. })
    }
}

/// Per-state job totals across every queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Known queues.
    pub queues: usize,
    /// Jobs waiting to be claimed.
    pub inactive: usize,
    /// Jobs claimed by a worker.
    pub active: usize,
    /// Jobs that failed and await an operator.
    pub failed: usize,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
