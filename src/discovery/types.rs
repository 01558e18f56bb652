//! Shared types used by the discovery backend client.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned while interacting with the discovery backend.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid discovery URL: {0}")]
    InvalidUrl(String),
    /// The backend could not be reached.
    #[error("Discovery backend unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),
    /// The referenced document does not exist in the backend.
    #[error("Document not found: {0}")]
    NotFound(String),
    /// The backend answered with an error envelope.
    #[error("Unexpected discovery response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the backend.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

/// Acknowledgement returned when a document is accepted for ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Identifier under which the backend stores the document.
    #[serde(default)]
    pub document_id: String,
    /// Processing status reported by the backend (`processing`, `available`, ...).
    #[serde(default)]
    pub status: String,
}

/// Outcome of a single-document deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionResult {
    /// Identifier of the deleted document.
    #[serde(default)]
    pub document_id: String,
    /// Status reported by the backend, normally `deleted`.
    #[serde(default)]
    pub status: String,
}
