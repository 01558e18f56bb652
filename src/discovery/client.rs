//! HTTP client wrapper for the discovery backend.

use crate::config::{Config, get_config};
use crate::discovery::types::{DeletionResult, DiscoveryError, IngestReceipt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Connection settings for the discovery backend.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Backend base URL.
    pub base_url: String,
    /// Environment that owns the target collection.
    pub environment_id: String,
    /// Collection receiving documents.
    pub collection_id: String,
    /// API version date sent as the `version` query parameter.
    pub api_version: String,
    /// Optional basic-auth username.
    pub username: Option<String>,
    /// Optional basic-auth password.
    pub password: Option<String>,
    /// Per-request timeout; an upload that never answers fails once it elapses.
    pub timeout: Duration,
}

impl DiscoverySettings {
    /// Derive settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.discovery_url.clone(),
            environment_id: config.discovery_environment_id.clone(),
            collection_id: config.discovery_collection_id.clone(),
            api_version: config.discovery_api_version.clone(),
            username: config.discovery_username.clone(),
            password: config.discovery_password.clone(),
            timeout: config.http_timeout(),
        }
    }
}

/// Lightweight HTTP client for discovery document operations.
pub struct DiscoveryService {
    client: Client,
    base_url: String,
    settings: DiscoverySettings,
}

impl DiscoveryService {
    /// Construct a new client using configuration derived from the environment.
    pub fn new() -> Result<Self, DiscoveryError> {
        Self::with_settings(DiscoverySettings::from_config(get_config()))
    }

    /// Construct a client from explicit settings.
    pub fn with_settings(settings: DiscoverySettings) -> Result<Self, DiscoveryError> {
        let client = Client::builder()
            .user_agent("discovery-reindexer/0.1")
            .timeout(settings.timeout)
            .build()?;
        let base_url = normalize_base_url(&settings.base_url).map_err(DiscoveryError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            environment = %settings.environment_id,
            collection = %settings.collection_id,
            has_credentials = settings.username.is_some(),
            "Initialized discovery HTTP client"
        );
        Ok(Self {
            client,
            base_url,
            settings,
        })
    }

    /// Create or replace the document stored under `document_id`.
    pub async fn add_document(
        &self,
        document_id: &str,
        payload: &Value,
    ) -> Result<IngestReceipt, DiscoveryError> {
        let part = Part::text(payload.to_string())
            .file_name(format!("{document_id}.json"))
            .mime_str("application/json")?;
        let form = Form::new().part("file", part);

        let response = self
            .request(Method::POST, &self.document_path(document_id))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let error = DiscoveryError::UnexpectedStatus { status, body };
            tracing::error!(document_id, error = %error, "Discovery ingestion failed");
            return Err(error);
        }

        let mut receipt = serde_json::from_str::<IngestReceipt>(&body).unwrap_or_default();
        if receipt.document_id.is_empty() {
            receipt.document_id = document_id.to_string();
        }
        if receipt.status.is_empty() {
            receipt.status = "accepted".into();
        }
        tracing::debug!(document_id, status = %receipt.status, "Document sent to discovery");
        Ok(receipt)
    }

    /// Delete a single document by identifier.
    pub async fn delete_document(&self, document_id: &str) -> Result<DeletionResult, DiscoveryError> {
        let response = self
            .request(Method::DELETE, &self.document_path(document_id))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => {
                tracing::warn!(document_id, "Discovery document not found");
                Err(DiscoveryError::NotFound(document_id.to_string()))
            }
            status if status.is_success() => {
                let mut result =
                    serde_json::from_str::<DeletionResult>(&body).unwrap_or_default();
                if result.document_id.is_empty() {
                    result.document_id = document_id.to_string();
                }
                if result.status.is_empty() {
                    result.status = "deleted".into();
                }
                tracing::info!(document_id, status = %result.status, "Discovery document deleted");
                Ok(result)
            }
            status => {
                let error = DiscoveryError::UnexpectedStatus { status, body };
                tracing::error!(document_id, error = %error, "Discovery deletion failed");
                Err(error)
            }
        }
    }

    fn document_path(&self, document_id: &str) -> String {
        format!(
            "v1/environments/{}/collections/{}/documents/{document_id}",
            self.settings.environment_id, self.settings.collection_id
        )
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self
            .client
            .request(method, url)
            .query(&[("version", self.settings.api_version.as_str())]);
        if let Some(username) = &self.settings.username
            && !username.is_empty()
        {
            req = req.basic_auth(username, self.settings.password.as_deref());
        }
        req
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}
