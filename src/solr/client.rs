//! HTTP client wrapper for querying the search index.

use crate::config::get_config;
use crate::solr::types::{PageResult, RawRecord, SelectResponse, SolrError};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;

/// Row count sent when a caller asks for "all remaining" records.
const ALL_ROWS: usize = i32::MAX as usize;

/// Request timeout applied when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lightweight HTTP client for search-index select queries.
pub struct SolrService {
    pub(crate) client: Client,
    pub(crate) base_url: String,
}

impl SolrService {
    /// Construct a new client using configuration derived from the environment.
    pub fn new() -> Result<Self, SolrError> {
        let config = get_config();
        Self::with_timeout(&config.solr_url, config.http_timeout())
    }

    /// Construct a client against an explicit base URL.
    pub fn with_base_url(url: &str) -> Result<Self, SolrError> {
        Self::with_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Construct a client whose requests fail once `timeout` elapses.
    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, SolrError> {
        let client = Client::builder()
            .user_agent("discovery-reindexer/0.1")
            .timeout(timeout)
            .build()?;
        let base_url = normalize_base_url(url).map_err(SolrError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            timeout_ms = timeout.as_millis() as u64,
            "Initialized search index HTTP client"
        );
        Ok(Self { client, base_url })
    }

    /// Fetch one page of raw records.
    ///
    /// `rows == 0` requests every record from `start` onwards.
    pub async fn fetch_page(
        &self,
        collection: &str,
        format: &str,
        start: usize,
        rows: usize,
    ) -> Result<PageResult, SolrError> {
        let wire_rows = if rows == 0 { ALL_ROWS } else { rows };
        self.select(collection, format, start, wire_rows).await
    }

    /// Ask the index for the total result count without transferring any record.
    pub async fn probe_total(&self, collection: &str, format: &str) -> Result<usize, SolrError> {
        let page = self.select(collection, format, 0, 0).await?;
        tracing::debug!(
            collection,
            total_found = page.total_found,
            "Probed search index total"
        );
        Ok(page.total_found)
    }

    async fn select(
        &self,
        collection: &str,
        format: &str,
        start: usize,
        rows: usize,
    ) -> Result<PageResult, SolrError> {
        let url = format_endpoint(&self.base_url, &format!("{collection}/select"));
        let response = self
            .client
            .request(Method::GET, url)
            .query(&[("q", "*:*"), ("wt", format)])
            .query(&[("start", start), ("rows", rows)])
            .send()
            .await
            .inspect_err(|error| {
                tracing::error!(collection, error = %error, "Search index unreachable");
            })?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let error = SolrError::UnexpectedStatus { status, body };
            tracing::error!(collection, error = %error, "Search index query failed");
            return Err(error);
        }

        parse_select_body(&body).inspect_err(|error| {
            tracing::error!(collection, start, rows, error = %error, "Search index payload rejected");
        })
    }
}

/// Decode a select response body into a [`PageResult`].
pub(crate) fn parse_select_body(body: &str) -> Result<PageResult, SolrError> {
    let payload: SelectResponse = serde_json::from_str(body)
        .map_err(|err| SolrError::MalformedResponse(err.to_string()))?;
    let envelope = payload.response;
    let records = envelope
        .docs
        .into_iter()
        .map(|doc| match doc {
            Value::Object(map) => Ok::<RawRecord, SolrError>(map),
            other => Err(SolrError::MalformedResponse(format!(
                "expected an object per document, found {other}"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PageResult {
        start: envelope.start,
        records,
        total_found: envelope.num_found,
    })
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

pub(crate) fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}
