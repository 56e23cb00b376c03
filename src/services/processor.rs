use std::io::Cursor;
use std::time::Duration;

use image::ImageFormat;
use tokio::time::sleep;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::record::{
    class_counts, Detection, DetectionRecord, FailureKind, ItemOutcome, OutcomeStatus,
};
use crate::services::inference::InferenceError;
use crate::services::severity::{self, UNASSESSABLE_SEVERITY};
use crate::services::storage::StorageError;

/// Result of the shared processing path (decode, infer, annotate,
/// persist). Used by batch item tasks and the manual upload route.
pub struct ProcessedImage {
    pub record: DetectionRecord,
    pub detections: Vec<Detection>,
    pub original_url: String,
    pub annotated_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Image bytes could not be decoded: {0}")]
    Decode(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Process one listed object for a batch (or a standalone key when
/// `job_id` is None): download, validate, infer, persist, and report a
/// structured outcome. Item-local failures are absorbed into the
/// outcome; they never propagate to the dispatcher.
pub async fn process_object(
    state: &AppState,
    store_name: &str,
    key: &str,
    job_id: Option<Uuid>,
) -> ItemOutcome {
    let start = std::time::Instant::now();
    tracing::info!(store = %store_name, key = %key, job_id = ?job_id, "Processing object");

    // The owning job must exist before any work or side effect happens.
    if let Some(id) = job_id {
        match queries::get_job(&state.db, id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::error!(job_id = %id, key = %key, "Batch job not found, skipping item");
                return ItemOutcome::failure(key, FailureKind::JobNotFound, "batch job not found");
            }
            Err(e) => {
                tracing::error!(job_id = %id, key = %key, error = %e, "Failed to fetch batch job");
                let outcome = ItemOutcome::failure(key, FailureKind::Internal, e.to_string());
                apply_counters(state, id, key, &outcome).await;
                return outcome;
            }
        }
    }

    let outcome = match process_object_inner(state, store_name, key, job_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(key = %key, error = %e, "Item processing failed");
            ItemOutcome::failure(key, FailureKind::Internal, e.to_string())
        }
    };

    if let Some(id) = job_id {
        apply_counters(state, id, key, &outcome).await;
    }

    match outcome.status {
        OutcomeStatus::Success => metrics::counter!("items_processed_total").increment(1),
        OutcomeStatus::Failure => metrics::counter!("items_failed_total").increment(1),
    }
    metrics::histogram!("item_processing_seconds").record(start.elapsed().as_secs_f64());

    outcome
}

async fn process_object_inner(
    state: &AppState,
    store_name: &str,
    key: &str,
    job_id: Option<Uuid>,
) -> Result<ItemOutcome, ProcessError> {
    // Download with bounded backoff; transport failures are the only
    // retryable class at the item level.
    let bytes = match download_with_retry(state, store_name, key).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return Ok(ItemOutcome::failure(
                key,
                FailureKind::Download,
                e.to_string(),
            ));
        }
    };

    if bytes.len() < state.config.min_image_bytes {
        tracing::warn!(
            key = %key,
            size = bytes.len(),
            min = state.config.min_image_bytes,
            "Image below minimum size, rejecting"
        );
        return Ok(ItemOutcome::failure(
            key,
            FailureKind::TooSmall,
            format!("image is {} bytes, minimum is {}", bytes.len(), state.config.min_image_bytes),
        ));
    }

    match process_bytes(state, store_name, &bytes, &extension_of(key), job_id).await {
        Ok(processed) => {
            let counts = class_counts(&processed.detections);
            Ok(ItemOutcome {
                status: OutcomeStatus::Success,
                item_key: key.to_string(),
                record_id: Some(processed.record.id),
                class_counts: counts,
                severity_score: processed.record.severity_score,
                original_url: Some(processed.original_url),
                annotated_url: processed.annotated_url,
                error: None,
                failure_kind: None,
            })
        }
        Err(e @ (ProcessError::Decode(_) | ProcessError::Inference(_))) => {
            // Permanent for this item. Persist the error payload with
            // the worst-case sentinel severity before reporting.
            let kind = match &e {
                ProcessError::Decode(_) => FailureKind::Decode,
                _ => FailureKind::Inference,
            };
            let record_id =
                persist_error_record(state, store_name, key, job_id, &e.to_string()).await;
            let mut outcome = ItemOutcome::failure(key, kind, e.to_string());
            outcome.record_id = record_id;
            Ok(outcome)
        }
        Err(e) => Err(e),
    }
}

/// Shared processing path: decode-validate, infer, store the original,
/// render and store the annotated image when there are detections,
/// compute severity, and persist the record in one write.
pub async fn process_bytes(
    state: &AppState,
    store_name: &str,
    bytes: &[u8],
    ext: &str,
    job_id: Option<Uuid>,
) -> Result<ProcessedImage, ProcessError> {
    // Validate decodability locally so malformed bytes surface as a
    // decode failure rather than an inference one.
    image::load_from_memory(bytes).map_err(|e| ProcessError::Decode(e.to_string()))?;

    let result = state
        .inference
        .infer(bytes, state.config.confidence_threshold)
        .await?;

    let unique_base = Uuid::new_v4();
    let original_key = format!("uploads/{unique_base}.{ext}");
    state
        .storage
        .upload(store_name, &original_key, bytes, content_type_for(ext))
        .await?;

    // Annotated image only exists when something was detected.
    let annotated_key = if !result.detections.is_empty() {
        match &result.annotated_image {
            Some(raw) => {
                let (encoded, out_ext, content_type) = reencode_annotated(raw, ext)?;
                let annotated_key = format!("results/{unique_base}.{out_ext}");
                state
                    .storage
                    .upload(store_name, &annotated_key, &encoded, content_type)
                    .await?;
                Some(annotated_key)
            }
            None => None,
        }
    } else {
        None
    };

    let severity = severity::severity_score(&result.detections);
    let results = serde_json::json!({ "detections": result.detections });

    let record = queries::insert_record(
        &state.db,
        job_id,
        store_name,
        &original_key,
        annotated_key.as_deref(),
        &results,
        severity,
    )
    .await?;

    let expiry = state.config.url_expiry_secs;
    let original_url = state
        .storage
        .presign_get(store_name, &original_key, expiry)
        .await?;
    let annotated_url = match &annotated_key {
        Some(k) => Some(state.storage.presign_get(store_name, k, expiry).await?),
        None => None,
    };

    tracing::info!(
        record_id = %record.id,
        detections = result.detections.len(),
        severity = ?severity,
        "Detection record persisted"
    );

    Ok(ProcessedImage {
        record,
        detections: result.detections,
        original_url,
        annotated_url,
    })
}

async fn download_with_retry(
    state: &AppState,
    store_name: &str,
    key: &str,
) -> Result<Vec<u8>, StorageError> {
    let attempts = state.config.download_retries.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        match state.storage.download(store_name, key).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    attempt = attempt + 1,
                    attempts,
                    error = %e,
                    "Download failed"
                );
                last_err = Some(e);
                if attempt + 1 < attempts {
                    sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }
    }

    Err(last_err.unwrap_or(StorageError::Config("no download attempts made".to_string())))
}

/// Persist an error-payload record with the unassessable sentinel.
/// Returns the record id, or None if the write itself failed (logged).
async fn persist_error_record(
    state: &AppState,
    store_name: &str,
    key: &str,
    job_id: Option<Uuid>,
    error: &str,
) -> Option<Uuid> {
    let results = serde_json::json!({ "error": error, "source_key": key });
    match queries::insert_record(
        &state.db,
        job_id,
        store_name,
        key,
        None,
        &results,
        Some(UNASSESSABLE_SEVERITY),
    )
    .await
    {
        Ok(record) => Some(record.id),
        Err(e) => {
            tracing::error!(key = %key, error = %e, "Failed to persist error record");
            None
        }
    }
}

/// Claim the idempotency key and apply the counter increment for this
/// outcome. A lost claim means a previous delivery already counted the
/// item; JobNotFound failures never touch the job at all.
pub(crate) async fn apply_counters(state: &AppState, job_id: Uuid, key: &str, outcome: &ItemOutcome) {
    if outcome.failure_kind == Some(FailureKind::JobNotFound) {
        return;
    }

    match queries::claim_item(&state.db, job_id, key).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(job_id = %job_id, key = %key, "Item already counted, skipping increment");
            return;
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, key = %key, error = %e, "Failed to claim item");
            return;
        }
    }

    let result = match outcome.status {
        OutcomeStatus::Success => queries::increment_succeeded(&state.db, job_id).await,
        OutcomeStatus::Failure => queries::increment_failed(&state.db, job_id).await,
    };
    if let Err(e) = result {
        tracing::error!(job_id = %job_id, key = %key, error = %e, "Counter increment failed");
    }
}

fn extension_of(key: &str) -> String {
    key.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_else(|| "jpg".to_string())
}

fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

/// Re-encode the service's annotated render into the input's format
/// family: PNG stays PNG, everything else becomes JPEG at quality 90.
fn reencode_annotated(
    raw: &[u8],
    ext: &str,
) -> Result<(Vec<u8>, &'static str, &'static str), ProcessError> {
    let img = image::load_from_memory(raw).map_err(|e| ProcessError::Decode(e.to_string()))?;
    let mut buf = Vec::new();

    if ext == "png" {
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| ProcessError::Decode(e.to_string()))?;
        Ok((buf, "png", "image/png"))
    } else {
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 90);
        img.write_with_encoder(encoder)
            .map_err(|e| ProcessError::Decode(e.to_string()))?;
        Ok((buf, "jpg", "image/jpeg"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_defaults_to_jpg() {
        assert_eq!(extension_of("cam1/shot.PNG"), "png");
        assert_eq!(extension_of("cam1/shot.jpeg"), "jpeg");
        assert_eq!(extension_of("cam1/noext"), "jpg");
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("png"), "image/png");
        assert_eq!(content_type_for("webp"), "image/webp");
        assert_eq!(content_type_for("jpg"), "image/jpeg");
        assert_eq!(content_type_for("jpeg"), "image/jpeg");
    }

    #[test]
    fn annotated_reencode_respects_input_format() {
        // 2x2 white image as PNG source material
        let img = image::DynamicImage::new_rgb8(2, 2);
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let (bytes, ext, ct) = reencode_annotated(&png, "png").unwrap();
        assert_eq!(ext, "png");
        assert_eq!(ct, "image/png");
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);

        let (bytes, ext, ct) = reencode_annotated(&png, "webp").unwrap();
        assert_eq!(ext, "jpg");
        assert_eq!(ct, "image/jpeg");
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    }
}
