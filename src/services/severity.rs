//! Severity scoring for strawberry disease detections.
//!
//! The score is recomputed from the detection payload every time the
//! payload is set; it is never stored independently. The parameter
//! table below is the canonical set for this deployment.

use std::collections::HashMap;

use crate::models::record::Detection;

struct DiseaseParams {
    base: f64,
    weight: f64,
    bonus: f64,
}

const HEALTHY_BASE: f64 = 0.05;
const HEALTHY_WEIGHT: f64 = 0.05;

/// Score when detections exist but no label is recognized.
const UNRECOGNIZED_FALLBACK: f64 = 0.2;

/// Sentinel written when an item fails before it can be assessed:
/// treat "could not assess" as worst case.
pub const UNASSESSABLE_SEVERITY: f64 = 1.0;

fn params_for(label: &str) -> Option<DiseaseParams> {
    let (base, weight, bonus) = match label {
        "angular leaf spot" => (0.4, 0.6, 0.05),
        "leaf spot" => (0.35, 0.55, 0.05),
        "gray mold" => (0.5, 0.5, 0.05),
        "blossom blight" => (0.4, 0.5, 0.05),
        "anthracnose fruit rot" => (0.55, 0.45, 0.05),
        "powdery mildew leaf" => (0.3, 0.5, 0.05),
        "powdery mildew fruit" => (0.45, 0.5, 0.05),
        _ => return None,
    };
    Some(DiseaseParams { base, weight, bonus })
}

/// Compute the severity score in [0.0, 1.0] for a detection list.
///
/// Per disease label present: `base + max(conf) * weight + (n-1) * bonus`,
/// final score is the max across disease labels. With no disease but a
/// "healthy" label: `max(0, base - max(conf) * weight)` with the healthy
/// parameters. Detections with only unrecognized labels score a fixed
/// fallback. No detections at all means severity is undefined, not zero.
pub fn severity_score(detections: &[Detection]) -> Option<f64> {
    if detections.is_empty() {
        return None;
    }

    let mut by_label: HashMap<String, Vec<f64>> = HashMap::new();
    for d in detections {
        by_label
            .entry(d.class.trim().to_lowercase())
            .or_default()
            .push(d.confidence);
    }

    let mut disease_max: Option<f64> = None;
    let mut healthy_confidences: Option<&Vec<f64>> = None;

    for (label, confidences) in &by_label {
        if label == "healthy" {
            healthy_confidences = Some(confidences);
            continue;
        }
        if let Some(p) = params_for(label) {
            let max_conf = confidences.iter().cloned().fold(f64::MIN, f64::max);
            let count = confidences.len() as f64;
            let score = p.base + max_conf * p.weight + (count - 1.0) * p.bonus;
            disease_max = Some(disease_max.map_or(score, |m: f64| m.max(score)));
        }
    }

    let raw = if let Some(score) = disease_max {
        score
    } else if let Some(confidences) = healthy_confidences {
        let max_conf = confidences.iter().cloned().fold(f64::MIN, f64::max);
        (HEALTHY_BASE - max_conf * HEALTHY_WEIGHT).max(0.0)
    } else {
        UNRECOGNIZED_FALLBACK
    };

    Some(round2(raw.clamp(0.0, 1.0)))
}

/// Human-readable recommendation from the batch-average severity.
pub fn recommendation(average_severity: Option<f64>) -> String {
    match average_severity {
        None => "No assessable detections in this batch.".to_string(),
        Some(s) if s < 0.2 => {
            "Crop appears healthy; continue routine monitoring.".to_string()
        }
        Some(s) if s < 0.5 => {
            "Mild disease pressure detected; inspect affected plants this week.".to_string()
        }
        Some(s) if s < 0.8 => {
            "Significant disease pressure; targeted treatment recommended.".to_string()
        }
        Some(_) => "Severe disease pressure; immediate intervention required.".to_string(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_angular_leaf_spot() {
        let detections = vec![Detection::new("angular leaf spot", 0.9)];
        // 0.4 + 0.9 * 0.6 = 0.94
        assert_eq!(severity_score(&detections), Some(0.94));
    }

    #[test]
    fn healthy_only() {
        let detections = vec![Detection::new("healthy", 0.8)];
        // max(0, 0.05 - 0.8 * 0.05) = 0.01
        assert_eq!(severity_score(&detections), Some(0.01));
    }

    #[test]
    fn no_detections_is_undefined_not_zero() {
        assert_eq!(severity_score(&[]), None);
    }

    #[test]
    fn unrecognized_labels_fall_back() {
        let detections = vec![
            Detection::new("tomato blight", 0.95),
            Detection::new("rust", 0.4),
        ];
        assert_eq!(severity_score(&detections), Some(0.2));
    }

    #[test]
    fn repeat_detections_add_count_bonus() {
        let detections = vec![
            Detection::new("angular leaf spot", 0.9),
            Detection::new("angular leaf spot", 0.6),
        ];
        // 0.4 + 0.9 * 0.6 + 1 * 0.05 = 0.99; max confidence wins, not both
        assert_eq!(severity_score(&detections), Some(0.99));
    }

    #[test]
    fn score_is_clamped_to_one() {
        let detections = vec![
            Detection::new("anthracnose fruit rot", 1.0),
            Detection::new("anthracnose fruit rot", 1.0),
            Detection::new("anthracnose fruit rot", 1.0),
        ];
        // 0.55 + 0.45 + 2 * 0.05 = 1.10 before clamping
        assert_eq!(severity_score(&detections), Some(1.0));
    }

    #[test]
    fn disease_wins_over_healthy() {
        let detections = vec![
            Detection::new("healthy", 0.9),
            Detection::new("gray mold", 0.5),
        ];
        // 0.5 + 0.5 * 0.5 = 0.75
        assert_eq!(severity_score(&detections), Some(0.75));
    }

    #[test]
    fn healthy_wins_over_unrecognized() {
        let detections = vec![
            Detection::new("healthy", 0.6),
            Detection::new("mystery speckle", 0.7),
        ];
        // healthy branch applies when no known disease is present
        assert_eq!(severity_score(&detections), Some(0.02));
    }

    #[test]
    fn labels_are_trimmed_and_lowercased() {
        let detections = vec![Detection::new("  Angular Leaf Spot ", 0.9)];
        assert_eq!(severity_score(&detections), Some(0.94));
    }

    #[test]
    fn recommendation_buckets() {
        assert!(recommendation(None).contains("No assessable"));
        assert!(recommendation(Some(0.05)).contains("healthy"));
        assert!(recommendation(Some(0.35)).contains("Mild"));
        assert!(recommendation(Some(0.65)).contains("Significant"));
        assert!(recommendation(Some(0.95)).contains("immediate"));
    }
}
