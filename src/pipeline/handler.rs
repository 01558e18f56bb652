//! Per-job processing logic executed by drain workers.

use crate::discovery::DiscoveryService;
use crate::pipeline::types::{ChildConversionJob, JobHandlerFailure};
use crate::queue::ConversionJob;
use async_trait::async_trait;
use std::sync::Arc;

/// Work performed for one claimed job.
///
/// Returning child jobs asks the drain controller to enqueue them before the job is marked
/// complete. Failures stay isolated to the job that raised them.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process `job`.
    async fn handle(&self, job: &ConversionJob)
    -> Result<Vec<ChildConversionJob>, JobHandlerFailure>;
}

/// Uploads the job payload to the discovery backend, then hands back its nested records.
pub struct DiscoveryIngestHandler {
    discovery: Arc<DiscoveryService>,
}

impl DiscoveryIngestHandler {
    /// Create a handler sending documents through `discovery`.
    pub fn new(discovery: Arc<DiscoveryService>) -> Self {
        Self { discovery }
    }
}

#[async_trait]
impl JobHandler for DiscoveryIngestHandler {
    async fn handle(
        &self,
        job: &ConversionJob,
    ) -> Result<Vec<ChildConversionJob>, JobHandlerFailure> {
        let record = &job.payload;
        if record.document_id.trim().is_empty() {
            return Err(JobHandlerFailure::InvalidPayload(format!(
                "job {} carries a record without identifier",
                job.id
            )));
        }

        let receipt = self
            .discovery
            .add_document(&record.document_id, &record.document_body())
            .await?;
        tracing::debug!(
            job_id = %job.id,
            queue = %job.queue,
            document_id = %receipt.document_id,
            status = %receipt.status,
            "Document ingested"
        );

        Ok(record
            .children
            .iter()
            .enumerate()
            .map(|(index, child)| ChildConversionJob {
                parent: job.id,
                index,
                record: child.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryError;
    use crate::discovery::client::DiscoverySettings;
    use crate::pipeline::types::FormattedRecord;
    use crate::queue::JobKind;
    use httpmock::prelude::*;
    use serde_json::{Map, json};
    use uuid::Uuid;

    fn handler(server: &MockServer) -> DiscoveryIngestHandler {
        let service = DiscoveryService::with_settings(DiscoverySettings {
            base_url: server.base_url(),
            environment_id: "env".into(),
            collection_id: "col".into(),
            api_version: "2017-11-07".into(),
            username: None,
            password: None,
            timeout: std::time::Duration::from_secs(5),
        })
        .expect("client");
        DiscoveryIngestHandler::new(Arc::new(service))
    }

    fn job(document_id: &str, children: Vec<FormattedRecord>) -> ConversionJob {
        let mut fields = Map::new();
        fields.insert("titulo".into(), json!("Soledades"));
        ConversionJob::new(
            Uuid::new_v4(),
            "obra-poesia",
            0,
            JobKind::Conversion,
            FormattedRecord {
                document_id: document_id.into(),
                category: "poesia".into(),
                fields,
                children,
            },
        )
    }

    fn child(id: &str) -> FormattedRecord {
        FormattedRecord {
            document_id: id.into(),
            category: "poesia".into(),
            fields: Map::new(),
            children: Vec::new(),
        }
    }

    #[tokio::test]
    async fn ingests_document_and_returns_children() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/environments/env/collections/col/documents/doc-1");
                then.status(202)
                    .json_body(json!({ "document_id": "doc-1", "status": "processing" }));
            })
            .await;

        let job = job("doc-1", vec![child("doc-1-a"), child("doc-1-b")]);
        let children = handler(&server).handle(&job).await.expect("handled");

        mock.assert_async().await;
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|child| child.parent == job.id));
        assert_eq!(children[1].index, 1);
        assert_eq!(children[1].record.document_id, "doc-1-b");
    }

    #[tokio::test]
    async fn backend_rejection_is_a_job_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(500).body("boom");
            })
            .await;

        let error = handler(&server)
            .handle(&job("doc-1", Vec::new()))
            .await
            .expect_err("failure");
        assert!(matches!(
            error,
            JobHandlerFailure::Discovery(DiscoveryError::UnexpectedStatus { .. })
        ));
    }

    #[tokio::test]
    async fn blank_identifier_is_rejected_without_calling_backend() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(202);
            })
            .await;

        let error = handler(&server)
            .handle(&job("  ", Vec::new()))
            .await
            .expect_err("invalid");
        assert!(matches!(error, JobHandlerFailure::InvalidPayload(_)));
        mock.assert_hits_async(0).await;
    }
}
