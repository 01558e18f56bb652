//! Core data types and error definitions for the re-index pipeline.

use crate::{
    discovery::DiscoveryError,
    queue::{JobId, QueueError},
    solr::SolrError,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Category assigned to records whose category attribute is missing or unusable.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Suffix distinguishing child-job queues from their parent queue.
pub const CHILD_QUEUE_SUFFIX: &str = ":children";

/// A raw record reshaped into the ingestion payload the discovery backend expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedRecord {
    /// Stable identifier the document is stored under.
    pub document_id: String,
    /// Category the record was grouped under.
    pub category: String,
    /// Document body sent to the backend.
    pub fields: Map<String, Value>,
    /// Nested records that need their own ingestion calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FormattedRecord>,
}

impl FormattedRecord {
    /// Body uploaded to the discovery backend.
    pub fn document_body(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// All records of one category, in encounter order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedBatch {
    /// Category label shared by every record of the batch.
    pub category: String,
    /// Records in the order they were fetched.
    pub records: Vec<FormattedRecord>,
}

/// A nested record discovered while processing a parent job.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildConversionJob {
    /// Parent job that produced the child.
    pub parent: JobId,
    /// Position of the child within its parent.
    pub index: usize,
    /// Payload to ingest.
    pub record: FormattedRecord,
}

/// Expected total job count for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTarget {
    /// Run the target belongs to.
    pub run_id: Uuid,
    /// Parent jobs enqueued for the run; normally the search index total.
    pub expected_total: usize,
}

/// Failure reported by a job handler. Isolated to the job that raised it.
#[derive(Debug, Error)]
pub enum JobHandlerFailure {
    /// The discovery backend rejected or could not receive the document.
    #[error("Discovery ingestion failed: {0}")]
    Discovery(#[from] DiscoveryError),
    /// The job payload could not be processed.
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),
}

/// Errors surfaced to the caller that triggered a run or a deletion.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The search index could not be reached or answered with an error status.
    #[error("Search index unavailable: {message}")]
    SourceUnavailable {
        /// Status reported by the search index, when it answered.
        status: Option<StatusCode>,
        /// Diagnostic message.
        message: String,
    },
    /// The search index payload lacked the expected result envelope.
    #[error("Malformed search index response: {0}")]
    MalformedResponse(String),
    /// The discovery backend could not be reached or answered with an error status.
    #[error("Discovery backend unavailable: {message}")]
    BackendUnavailable {
        /// Status reported by the backend, when it answered.
        status: Option<StatusCode>,
        /// Diagnostic message.
        message: String,
    },
    /// The referenced document or job does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The queue store rejected an operation.
    #[error("Queue store unavailable: {0}")]
    QueueUnavailable(String),
    /// A job handler failed outside of a worker.
    #[error("Job handler failed: {0}")]
    JobHandlerFailure(#[from] JobHandlerFailure),
    /// A run for the collection is still draining.
    #[error("A run for collection '{0}' is already in progress")]
    RunInProgress(String),
}

impl PipelineError {
    /// Stable machine-readable kind used in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "SourceUnavailable",
            Self::MalformedResponse(_) => "MalformedResponse",
            Self::BackendUnavailable { .. } => "BackendUnavailable",
            Self::NotFound(_) => "NotFound",
            Self::QueueUnavailable(_) => "QueueUnavailable",
            Self::JobHandlerFailure(_) => "JobHandlerFailure",
            Self::RunInProgress(_) => "RunInProgress",
        }
    }

    /// HTTP status mirroring the failing collaborator, `500` when it reported none.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SourceUnavailable {
                status: Some(status),
                ..
            }
            | Self::BackendUnavailable {
                status: Some(status),
                ..
            } => *status,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RunInProgress(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SolrError> for PipelineError {
    fn from(error: SolrError) -> Self {
        match error {
            SolrError::MalformedResponse(message) => Self::MalformedResponse(message),
            SolrError::UnexpectedStatus { status, body } => Self::SourceUnavailable {
                status: Some(status),
                message: body,
            },
            other => Self::SourceUnavailable {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<DiscoveryError> for PipelineError {
    fn from(error: DiscoveryError) -> Self {
        match error {
            DiscoveryError::NotFound(id) => Self::NotFound(id),
            DiscoveryError::UnexpectedStatus { status, body } => Self::BackendUnavailable {
                status: Some(status),
                message: body,
            },
            other => Self::BackendUnavailable {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<QueueError> for PipelineError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::NotFound(id) => Self::NotFound(format!("job {id}")),
            other => Self::QueueUnavailable(other.to_string()),
        }
    }
}

/// Summary returned once a run has been kicked off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Identifier of the run.
    pub run_id: Uuid,
    /// Total reported by the search index.
    pub total_found: usize,
    /// Queues the run routed jobs to, one per category.
    pub queues: Vec<String>,
    /// Parent jobs enqueued.
    pub jobs_enqueued: usize,
}
