//! HTTP surface for the re-indexer.
//!
//! This module exposes a compact Axum router:
//!
//! - `GET /admin/create-update/discovery/{collection}` – Fetch every record of a search-index
//!   collection, route the records to per-category queues, and start draining them. Returns
//!   once the jobs are enqueued.
//! - `GET /admin/delete-document/discovery/{document_id}` – Delete one document from the
//!   discovery backend. Queues are not touched.
//! - `POST /admin/jobs/{id}/requeue` – Put a failed job back in its queue.
//! - `GET /metrics` – Pipeline counters plus per-state queue totals.
//! - `GET /commands` – Machine-readable command catalog.
//!
//! Failures are reported as `{"error": {"kind", "message"}, "code"}` with the status of the
//! collaborator that failed, `404` for unknown documents or jobs, `500` otherwise.

use crate::discovery::DeletionResult;
use crate::metrics::MetricsSnapshot;
use crate::pipeline::{PipelineError, ReindexApi};
use crate::queue::{JobCounts, JobId};
use axum::{
    Json, Router,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Build the HTTP router exposing the re-index API surface.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: ReindexApi + 'static,
{
    Router::new()
        .route(
            "/admin/create-update/discovery/:collection",
            get(create_update::<S>),
        )
        .route(
            "/admin/delete-document/discovery/:document_id",
            get(delete_document::<S>),
        )
        .route("/admin/jobs/:id/requeue", post(requeue_job::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/commands", get(get_commands))
        .with_state(service)
}

/// Success response for the trigger endpoint.
#[derive(Serialize)]
struct TriggerResponse {
    result: &'static str,
    run_id: String,
    total_found: usize,
    queues: Vec<String>,
}

/// Kick off a full re-index of `collection`.
async fn create_update<S>(
    State(service): State<Arc<S>>,
    Path(collection): Path<String>,
) -> Result<Json<TriggerResponse>, AppError>
where
    S: ReindexApi,
{
    let outcome = service.start_run(&collection).await?;
    tracing::info!(
        collection,
        run_id = %outcome.run_id,
        jobs = outcome.jobs_enqueued,
        "Trigger request accepted"
    );
    Ok(Json(TriggerResponse {
        result: "Queues are processing",
        run_id: outcome.run_id.to_string(),
        total_found: outcome.total_found,
        queues: outcome.queues,
    }))
}

/// Delete a single document and relay the backend's answer.
async fn delete_document<S>(
    State(service): State<Arc<S>>,
    Path(document_id): Path<String>,
) -> Result<Json<DeletionResult>, AppError>
where
    S: ReindexApi,
{
    let result = service.delete_document(&document_id).await?;
    Ok(Json(result))
}

#[derive(Serialize)]
struct RequeueResponse {
    requeued: String,
}

async fn requeue_job<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<Json<RequeueResponse>, AppError>
where
    S: ReindexApi,
{
    let id: JobId = id
        .parse()
        .map_err(|_| AppError(PipelineError::NotFound(format!("job {id}"))))?;
    service.requeue_job(id).await?;
    Ok(Json(RequeueResponse {
        requeued: id.to_string(),
    }))
}

/// Response body for `GET /metrics`.
#[derive(Serialize)]
struct MetricsResponse {
    pipeline: MetricsSnapshot,
    queues: JobCounts,
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Result<Json<MetricsResponse>, AppError>
where
    S: ReindexApi,
{
    let queues = service.queue_counts().await?;
    Ok(Json(MetricsResponse {
        pipeline: service.metrics_snapshot(),
        queues,
    }))
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for tools and operators.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "create_update",
                method: "GET",
                path: "/admin/create-update/discovery/{collection}",
                description: "Fetch every record of a search-index collection, enqueue one conversion job per record grouped by category, and drain the queues in the background. Response returns { \"result\": \"Queues are processing\" }.",
            },
            CommandDescriptor {
                name: "delete_document",
                method: "GET",
                path: "/admin/delete-document/discovery/{document_id}",
                description: "Delete one document from the discovery backend. Unknown identifiers answer 404.",
            },
            CommandDescriptor {
                name: "requeue_job",
                method: "POST",
                path: "/admin/jobs/{id}/requeue",
                description: "Move a failed job back to its queue under the same identity.",
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return pipeline counters and per-state queue totals.",
            },
        ],
    })
}

struct AppError(PipelineError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            },
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(inner: PipelineError) -> Self {
        Self(inner)
    }
}
