use base64::Engine;
use reqwest::Client;
use serde::Deserialize;

use crate::models::record::Detection;

/// Client for the external YOLO inference service.
///
/// The model itself is opaque to this crate: bytes in, detections and
/// an optional annotated render out. The client is constructed once at
/// process start and shared through `AppState`.
pub struct InferenceClient {
    http: Client,
    url: String,
    api_token: String,
}

#[derive(Deserialize)]
struct InferResponse {
    detections: Vec<RawDetection>,
    /// Base64-encoded annotated image, present when the service drew
    /// at least one bounding box.
    annotated_image: Option<String>,
}

#[derive(Deserialize)]
struct RawDetection {
    class: String,
    confidence: f64,
}

/// Inference output: the detection list plus the annotated image bytes
/// as returned by the service, still in its own encoding.
pub struct InferenceResult {
    pub detections: Vec<Detection>,
    pub annotated_image: Option<Vec<u8>>,
}

impl InferenceClient {
    pub fn new(url: &str, api_token: &str) -> Self {
        Self {
            http: Client::new(),
            url: url.to_string(),
            api_token: api_token.to_string(),
        }
    }

    /// Run the model on one image. `image_bytes` must already have
    /// passed local decode validation; a service-side failure here is
    /// an `InferenceError::Http` or `InferenceError::Service`, both
    /// permanent for the item.
    pub async fn infer(
        &self,
        image_bytes: &[u8],
        confidence_threshold: f64,
    ) -> Result<InferenceResult, InferenceError> {
        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_bytes),
            "confidence": confidence_threshold,
        });

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(InferenceError::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Service(format!("{status}: {body}")));
        }

        let parsed: InferResponse = response.json().await.map_err(InferenceError::Http)?;

        let detections = parsed
            .detections
            .into_iter()
            .map(|d| Detection::new(d.class, d.confidence))
            .collect();

        let annotated_image = parsed
            .annotated_image
            .map(|b64| base64::engine::general_purpose::STANDARD.decode(b64))
            .transpose()
            .map_err(InferenceError::Encoding)?;

        Ok(InferenceResult {
            detections,
            annotated_image,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference service returned an error: {0}")]
    Service(String),

    #[error("Annotated image payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
}
