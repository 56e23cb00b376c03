//! Aggregator/Finalizer: reduce the full outcome set for a batch into
//! counters, a summary and a terminal status, then write it once.

use std::collections::HashMap;

use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::job::{BatchSummary, JobStatus};
use crate::models::record::ItemOutcome;
use crate::services::retention;
use crate::services::severity;

/// Reduction of a batch's outcome set.
pub struct AggregateStats {
    pub succeeded: i32,
    pub failed: i32,
    pub class_counts: HashMap<String, i64>,
    pub average_severity: Option<f64>,
}

/// Reduce outcomes: success/failure totals, per-class detection counts
/// summed across successful outcomes, and the mean severity over
/// successful outcomes that carry one.
pub fn reduce_outcomes(outcomes: &[ItemOutcome]) -> AggregateStats {
    let mut succeeded = 0;
    let mut failed = 0;
    let mut class_counts: HashMap<String, i64> = HashMap::new();
    let mut severity_sum = 0.0;
    let mut severity_count = 0u32;

    for outcome in outcomes {
        if outcome.is_success() {
            succeeded += 1;
            if let Some(score) = outcome.severity_score {
                severity_sum += score;
                severity_count += 1;
            }
            for (class, count) in &outcome.class_counts {
                *class_counts.entry(class.clone()).or_insert(0) += count;
            }
        } else {
            failed += 1;
        }
    }

    let average_severity = if severity_count > 0 {
        Some((severity_sum / f64::from(severity_count) * 1000.0).round() / 1000.0)
    } else {
        None
    };

    AggregateStats {
        succeeded,
        failed,
        class_counts,
        average_severity,
    }
}

/// Terminal status rule: no failures means completed (vacuously so for
/// an empty batch), no successes means failed, anything else partial.
pub fn derive_status(succeeded: i32, failed: i32) -> JobStatus {
    if failed == 0 {
        JobStatus::Completed
    } else if succeeded > 0 {
        JobStatus::PartiallyCompleted
    } else {
        JobStatus::Failed
    }
}

/// Finalize a batch job from its complete outcome set.
///
/// Runs exactly once per job, after the dispatcher's join. A missing
/// job is an operator-visible anomaly, logged and abandoned. Once the
/// finalizing update commits, the job is done; the immediate retention
/// pass that follows can fail without affecting it.
pub async fn finalize(state: &AppState, job_id: Uuid, outcomes: &[ItemOutcome]) {
    tracing::info!(job_id = %job_id, outcomes = outcomes.len(), "Finalizing batch");

    let job = match queries::get_job(&state.db, job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::error!(job_id = %job_id, "Job vanished before finalization, aborting");
            return;
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to fetch job for finalization");
            return;
        }
    };

    let stats = reduce_outcomes(outcomes);

    // Anything found but never reported successful counts as failed,
    // which also covers outcomes lost to task-level anomalies.
    let failed = job.total_found - stats.succeeded;
    if failed != stats.failed {
        tracing::warn!(
            job_id = %job_id,
            reduced_failed = stats.failed,
            accounted_failed = failed,
            "Outcome set does not cover all listed items"
        );
    }

    let status = derive_status(stats.succeeded, failed);
    let error = match status {
        JobStatus::Failed if job.error.is_none() => Some("All images failed to process."),
        _ => None,
    };

    let summary = BatchSummary {
        message: format!(
            "Found {}, success {}, failed {}",
            job.total_found, stats.succeeded, failed
        ),
        detected_classes_summary: stats.class_counts,
        average_severity_score: stats.average_severity,
        recommendation: severity::recommendation(stats.average_severity),
    };

    let summary_value = match serde_json::to_value(&summary) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Summary serialization failed");
            serde_json::Value::Null
        }
    };

    if let Err(e) = queries::finalize_job(
        &state.db,
        job_id,
        status,
        stats.succeeded,
        failed,
        &summary_value,
        error,
    )
    .await
    {
        tracing::error!(job_id = %job_id, error = %e, "Finalizing update failed");
        return;
    }

    metrics::counter!("batches_finalized_total").increment(1);
    tracing::info!(
        job_id = %job_id,
        status = %status,
        succeeded = stats.succeeded,
        failed,
        avg_severity = ?stats.average_severity,
        "Batch finalized"
    );

    // Finalization is already committed; cleanup failures are logged
    // and never roll it back.
    retention::run_immediate_batch_cleanup(state, job_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record::{FailureKind, OutcomeStatus};

    fn success(key: &str, severity: Option<f64>, classes: &[(&str, i64)]) -> ItemOutcome {
        ItemOutcome {
            status: OutcomeStatus::Success,
            item_key: key.to_string(),
            record_id: Some(uuid::Uuid::new_v4()),
            class_counts: classes
                .iter()
                .map(|(c, n)| (c.to_string(), *n))
                .collect(),
            severity_score: severity,
            original_url: Some("https://example/original".to_string()),
            annotated_url: None,
            error: None,
            failure_kind: None,
        }
    }

    #[test]
    fn counts_cover_every_outcome() {
        let outcomes = vec![
            success("a.jpg", Some(0.5), &[("gray mold", 2)]),
            success("b.jpg", None, &[]),
            ItemOutcome::failure("c.jpg", FailureKind::TooSmall, "too small"),
        ];
        let stats = reduce_outcomes(&outcomes);
        assert_eq!(stats.succeeded + stats.failed, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn class_counts_sum_successes_only() {
        let mut failure = ItemOutcome::failure("x.jpg", FailureKind::Decode, "bad bytes");
        failure.class_counts.insert("gray mold".to_string(), 9);

        let outcomes = vec![
            success("a.jpg", Some(0.9), &[("gray mold", 1), ("leaf spot", 2)]),
            success("b.jpg", Some(0.7), &[("gray mold", 3)]),
            failure,
        ];
        let stats = reduce_outcomes(&outcomes);
        assert_eq!(stats.class_counts["gray mold"], 4);
        assert_eq!(stats.class_counts["leaf spot"], 2);
    }

    #[test]
    fn average_skips_null_severities() {
        let outcomes = vec![
            success("a.jpg", Some(0.9), &[]),
            success("b.jpg", None, &[]),
            success("c.jpg", Some(0.1), &[]),
        ];
        let stats = reduce_outcomes(&outcomes);
        assert_eq!(stats.average_severity, Some(0.5));
    }

    #[test]
    fn average_is_null_when_no_severities() {
        let outcomes = vec![success("a.jpg", None, &[])];
        let stats = reduce_outcomes(&outcomes);
        assert_eq!(stats.average_severity, None);
    }

    #[test]
    fn status_rule() {
        assert_eq!(derive_status(3, 0), JobStatus::Completed);
        assert_eq!(derive_status(0, 0), JobStatus::Completed);
        assert_eq!(derive_status(2, 1), JobStatus::PartiallyCompleted);
        assert_eq!(derive_status(0, 3), JobStatus::Failed);
    }

    #[test]
    fn empty_outcome_set_reduces_cleanly() {
        let stats = reduce_outcomes(&[]);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.failed, 0);
        assert!(stats.class_counts.is_empty());
        assert_eq!(stats.average_severity, None);
    }
}
