//! Batch submission and status polling.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use payhook_batch::SubmitError;
use payhook_core::{BatchJob, BatchOperation, BatchStore, EventStore, ItemRef, JobId};

use crate::{
    handlers::{error_response, storage_error_response},
    server::AppState,
};

/// Body of `POST /batch`.
#[derive(Debug, Deserialize)]
pub struct SubmitBatchRequest {
    /// Operation applied to every item.
    pub operation: String,
    /// Target record references.
    pub items: Vec<String>,
}

/// Acceptance response for a submitted batch.
#[derive(Debug, Serialize)]
pub struct SubmitBatchResponse {
    /// Identifier to poll at `GET /batch/{job_id}`.
    pub job_id: JobId,
    /// Initial job status.
    pub status: &'static str,
}

/// Point-in-time job snapshot returned from `GET /batch/{job_id}`.
#[derive(Debug, Serialize)]
pub struct BatchStatusResponse {
    /// Job identifier.
    pub job_id: JobId,
    /// The submitted operation.
    pub operation: BatchOperation,
    /// Current status.
    pub status: String,
    /// Total items in the job.
    pub total_items: usize,
    /// Items attempted so far.
    pub processed_count: u32,
    /// Items that succeeded.
    pub succeeded_count: u32,
    /// Items that failed.
    pub failed_count: u32,
    /// Per-item outcomes recorded so far.
    pub item_results: std::collections::HashMap<ItemRef, payhook_core::ItemOutcome>,
}

impl From<BatchJob> for BatchStatusResponse {
    fn from(job: BatchJob) -> Self {
        Self {
            job_id: job.id,
            operation: job.operation,
            status: job.status.to_string(),
            total_items: job.items.len(),
            processed_count: job.processed_count,
            succeeded_count: job.succeeded_count,
            failed_count: job.failed_count,
            item_results: job.item_results,
        }
    }
}

/// Accepts a batch job for background execution.
#[instrument(name = "submit_batch", skip(state, request))]
pub async fn submit_batch<S: EventStore, B: BatchStore>(
    State(state): State<AppState<S, B>>,
    Json(request): Json<SubmitBatchRequest>,
) -> Response {
    let operation: BatchOperation = match request.operation.parse() {
        Ok(operation) => operation,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "invalid_operation", err),
    };
    let items: Vec<ItemRef> = request.items.iter().map(ItemRef::new).collect();

    match state.batch.submit(operation, items).await {
        Ok(job_id) => {
            let response = SubmitBatchResponse { job_id, status: "running" };
            (StatusCode::ACCEPTED, Json(response)).into_response()
        },
        Err(err @ (SubmitError::Empty | SubmitError::TooLarge { .. })) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_batch", err.to_string())
        },
        Err(err @ SubmitError::DuplicateItem(_)) => {
            error_response(StatusCode::BAD_REQUEST, "duplicate_item", err.to_string())
        },
        Err(SubmitError::Storage(err)) => storage_error_response(&err),
    }
}

/// Returns a live snapshot of a batch job.
#[instrument(name = "batch_status", skip(state))]
pub async fn batch_status<S: EventStore, B: BatchStore>(
    State(state): State<AppState<S, B>>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match state.batch.status(JobId::from(job_id)).await {
        Ok(Some(job)) => {
            (StatusCode::OK, Json(BatchStatusResponse::from(job))).into_response()
        },
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("batch job {job_id} not found"),
        ),
        Err(err) => storage_error_response(&err),
    }
}
