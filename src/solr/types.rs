//! Shared types used by the search-index client and pager.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// One search-index hit. Opaque apart from the category and identifier attributes.
pub type RawRecord = Map<String, Value>;

/// Errors returned while querying the search index.
#[derive(Debug, Error)]
pub enum SolrError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid search index URL: {0}")]
    InvalidUrl(String),
    /// The search index could not be reached.
    #[error("Search index unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),
    /// The search index answered with a non-success status.
    #[error("Unexpected search index response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the search index.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// The payload lacked the `response` envelope or was not JSON.
    #[error("Malformed search index response: {0}")]
    MalformedResponse(String),
}

/// One page of raw records together with the total reported by the index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResult {
    /// Offset of the first record in this page.
    pub start: usize,
    /// Records in index order.
    pub records: Vec<RawRecord>,
    /// Total number of results declared by the index for the query.
    pub total_found: usize,
}

/// Every record of a collection gathered across pages.
#[derive(Debug, Clone, Default)]
pub struct FetchedRecords {
    /// Total declared by the initial probe.
    pub total_found: usize,
    /// Concatenation of every page, in index order.
    pub records: Vec<RawRecord>,
    /// Number of page requests issued after the probe.
    pub pages: usize,
}

#[derive(Deserialize)]
pub(crate) struct SelectResponse {
    pub(crate) response: SelectEnvelope,
}

#[derive(Deserialize)]
pub(crate) struct SelectEnvelope {
    #[serde(rename = "numFound")]
    pub(crate) num_found: usize,
    #[serde(default)]
    pub(crate) start: usize,
    #[serde(default)]
    pub(crate) docs: Vec<Value>,
}
