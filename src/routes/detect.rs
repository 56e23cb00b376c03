use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::record::Detection;
use crate::services::processor::{self, ProcessError};
use crate::services::retention;

#[derive(Serialize)]
pub struct DetectResponse {
    pub record_id: Uuid,
    pub detections: Vec<Detection>,
    pub severity_score: Option<f64>,
    pub original_url: String,
    pub annotated_url: Option<String>,
}

/// POST /api/v1/detect — synchronous manual detection.
///
/// Uploads go to the default store and produce an ownerless record
/// (no batch job back-reference), followed by an immediate
/// manual-count retention pass.
pub async fn detect_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<DetectResponse>, StatusCode> {
    let mut image_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        if field.name() == Some("image") {
            let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
            image_data = Some(data.to_vec());
        }
    }

    let image_data = image_data.ok_or(StatusCode::BAD_REQUEST)?;

    if image_data.len() < state.config.min_image_bytes {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let format =
        image::guess_format(&image_data).map_err(|_| StatusCode::UNSUPPORTED_MEDIA_TYPE)?;
    let ext = match format {
        image::ImageFormat::Png => "png",
        image::ImageFormat::WebP => "webp",
        image::ImageFormat::Jpeg => "jpg",
        _ => return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE),
    };

    let processed = processor::process_bytes(
        &state,
        &state.config.default_store,
        &image_data,
        ext,
        None,
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Manual detection failed");
        match e {
            ProcessError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProcessError::Inference(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    })?;

    // Keep the manual record pool bounded right away rather than
    // waiting for the nightly pass.
    retention::run_immediate_manual_cleanup(&state).await;

    Ok(Json(DetectResponse {
        record_id: processed.record.id,
        severity_score: processed.record.severity_score,
        detections: processed.detections,
        original_url: processed.original_url,
        annotated_url: processed.annotated_url,
    }))
}
