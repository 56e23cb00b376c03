use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::Display;
use uuid::Uuid;

/// A single detection reported by the inference service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f64,
    pub confidence_str: String,
}

impl Detection {
    pub fn new(class: impl Into<String>, confidence: f64) -> Self {
        Self {
            class: class.into(),
            confidence,
            confidence_str: format!("{confidence:.2}"),
        }
    }
}

/// Persisted result of one processed (or attempted) image.
///
/// `batch_job_id` is `None` for manual uploads. `results` holds either
/// `{"detections": [...]}` or `{"error": ..., "source_key": ...}` when
/// processing failed before any detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: Uuid,
    pub batch_job_id: Option<Uuid>,
    pub store_name: String,
    pub original_key: String,
    pub annotated_key: Option<String>,
    pub results: Option<serde_json::Value>,
    pub severity_score: Option<f64>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Why an item failed. None of these are retried at the item level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    JobNotFound,
    TooSmall,
    Download,
    Decode,
    Inference,
    Timeout,
    Internal,
}

/// Structured outcome reported by one Item Processor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub status: OutcomeStatus,
    pub item_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Uuid>,
    #[serde(default)]
    pub class_counts: HashMap<String, i64>,
    pub severity_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl ItemOutcome {
    pub fn failure(item_key: impl Into<String>, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            item_key: item_key.into(),
            record_id: None,
            class_counts: HashMap::new(),
            severity_score: None,
            original_url: None,
            annotated_url: None,
            error: Some(error.into()),
            failure_kind: Some(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Count detections per class label.
pub fn class_counts(detections: &[Detection]) -> HashMap<String, i64> {
    let mut counts = HashMap::new();
    for d in detections {
        *counts.entry(d.class.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_string_is_derived() {
        let d = Detection::new("angular leaf spot", 0.876);
        assert_eq!(d.confidence_str, "0.88");
    }

    #[test]
    fn class_counts_groups_by_label() {
        let detections = vec![
            Detection::new("gray mold", 0.9),
            Detection::new("gray mold", 0.7),
            Detection::new("healthy", 0.8),
        ];
        let counts = class_counts(&detections);
        assert_eq!(counts["gray mold"], 2);
        assert_eq!(counts["healthy"], 1);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn failure_outcome_carries_kind() {
        let outcome = ItemOutcome::failure("a/b.jpg", FailureKind::TooSmall, "image too small");
        assert!(!outcome.is_success());
        assert_eq!(outcome.failure_kind, Some(FailureKind::TooSmall));
        assert!(outcome.severity_score.is_none());
        assert!(outcome.class_counts.is_empty());
    }
}
