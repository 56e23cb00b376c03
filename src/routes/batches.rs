use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::job::JobStatus;
use crate::services::queue::DispatchCommand;

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitBatchRequest {
    /// Bucket holding the images
    #[garde(length(min = 3, max = 63))]
    pub store_name: String,

    /// Key prefix to scan, e.g. "field7/cam2"
    #[garde(length(max = 1024))]
    pub prefix: String,
}

#[derive(Serialize)]
pub struct SubmitBatchResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Serialize)]
pub struct BatchStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub store_name: String,
    pub prefix: String,
    pub total_found: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub summary: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// POST /api/v1/batches — submit a batch over a store/prefix.
///
/// Creates the job row and enqueues the dispatch command; the id is
/// returned immediately, long before the batch completes.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<SubmitBatchRequest>,
) -> Result<(StatusCode, Json<SubmitBatchResponse>), StatusCode> {
    if request.validate().is_err() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let job = queries::create_job(&state.db, &request.store_name, &request.prefix)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to create batch job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let command = DispatchCommand {
        job_id: job.id,
        store_name: request.store_name.clone(),
        prefix: request.prefix.clone(),
    };

    if let Err(e) = state.queue.enqueue(&command).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue dispatch command");
        // No item tasks exist yet; failing the job here leaves nothing
        // partially mutable.
        let _ = queries::mark_job_failed(&state.db, job.id, "Failed to enqueue dispatch").await;
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    metrics::counter!("batches_submitted_total").increment(1);
    tracing::info!(job_id = %job.id, store = %request.store_name, prefix = %request.prefix, "Batch submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitBatchResponse {
            job_id: job.id,
            status: job.status,
            message: "Batch accepted for processing".to_string(),
        }),
    ))
}

/// GET /api/v1/batches/{job_id} — current job status and summary.
pub async fn get_batch_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<BatchStatusResponse>, StatusCode> {
    let job = queries::get_job(&state.db, job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to fetch batch job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(BatchStatusResponse {
        job_id: job.id,
        status: job.status,
        store_name: job.store_name,
        prefix: job.prefix,
        total_found: job.total_found,
        succeeded: job.succeeded,
        failed: job.failed,
        summary: job.summary,
        error: job.error,
        created_at: job.created_at,
        updated_at: job.updated_at,
    }))
}
