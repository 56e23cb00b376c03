//! Data retention: count- and age-based policies over detection
//! records and batch jobs.
//!
//! Every policy is idempotent and re-runnable, and swallows its own
//! errors so one failing policy never blocks the others in the same
//! pass. Deletion is explicit: blobs are removed from the object store
//! first, then the rows (job deletion cascades to its records and
//! claims at the row level only).

use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;

#[derive(Debug, Default, Serialize)]
pub struct CleanupSummary {
    pub manual_records_deleted_by_count: u64,
    pub manual_records_deleted_by_age: u64,
    pub batch_jobs_deleted_by_age: u64,
    pub batch_jobs_deleted_by_count: u64,
}

/// Full scheduled pass, invoked by the worker's daily clock.
pub async fn run_scheduled_cleanup(state: &AppState) -> CleanupSummary {
    tracing::info!("Scheduled retention pass starting");

    let summary = CleanupSummary {
        batch_jobs_deleted_by_age: cleanup_jobs_by_age(state).await,
        batch_jobs_deleted_by_count: cleanup_jobs_by_count(state).await,
        manual_records_deleted_by_count: cleanup_manual_records_by_count(state).await,
        manual_records_deleted_by_age: cleanup_manual_records_by_age(state).await,
    };

    tracing::info!(summary = ?summary, "Scheduled retention pass complete");
    summary
}

/// Count-based job cleanup run synchronously after a batch finalizes.
/// The just-finalized job is already visible to the query; it is the
/// newest and therefore the last candidate for deletion.
pub async fn run_immediate_batch_cleanup(state: &AppState, finalized_job_id: Uuid) -> u64 {
    tracing::info!(job_id = %finalized_job_id, "Immediate batch cleanup after finalization");
    cleanup_jobs_by_count(state).await
}

/// Count-based manual-record cleanup run after a manual upload.
pub async fn run_immediate_manual_cleanup(state: &AppState) -> u64 {
    cleanup_manual_records_by_count(state).await
}

/// Keep the newest N ownerless records, delete the excess.
async fn cleanup_manual_records_by_count(state: &AppState) -> u64 {
    let keep = state.config.manual_records_to_keep.max(0);

    let ids = match queries::manual_record_ids_beyond(&state.db, keep).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "Manual count retention: query failed");
            return 0;
        }
    };

    tracing::info!(keep, excess = ids.len(), "Manual count retention");
    delete_record_set(state, &ids).await
}

/// Delete ownerless records older than the configured age.
/// `days_to_keep_manual_records <= 0` means the policy is disabled,
/// not "delete everything older than now".
async fn cleanup_manual_records_by_age(state: &AppState) -> u64 {
    let days = state.config.days_to_keep_manual_records;
    if days <= 0 {
        tracing::debug!("Manual age retention disabled");
        return 0;
    }

    let cutoff = Utc::now() - Duration::days(days);
    let ids = match queries::manual_record_ids_older_than(&state.db, cutoff).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "Manual age retention: query failed");
            return 0;
        }
    };

    tracing::info!(days, candidates = ids.len(), "Manual age retention");
    delete_record_set(state, &ids).await
}

/// Delete non-pending jobs older than the configured age.
async fn cleanup_jobs_by_age(state: &AppState) -> u64 {
    let days = state.config.days_to_keep_batches;
    if days <= 0 {
        tracing::debug!("Job age retention disabled");
        return 0;
    }

    let cutoff = Utc::now() - Duration::days(days);
    let ids = match queries::job_ids_older_than(&state.db, cutoff).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "Job age retention: query failed");
            return 0;
        }
    };

    tracing::info!(days, candidates = ids.len(), "Job age retention");
    delete_job_set(state, &ids).await
}

/// Keep the newest M non-pending jobs, delete the excess.
async fn cleanup_jobs_by_count(state: &AppState) -> u64 {
    let keep = state.config.batch_jobs_to_keep.max(0);

    let ids = match queries::job_ids_beyond(&state.db, keep).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "Job count retention: query failed");
            return 0;
        }
    };

    tracing::info!(keep, excess = ids.len(), "Job count retention");
    delete_job_set(state, &ids).await
}

/// Delete records: their blobs first, then the rows.
async fn delete_record_set(state: &AppState, record_ids: &[Uuid]) -> u64 {
    if record_ids.is_empty() {
        return 0;
    }

    let refs = match queries::record_blob_refs(&state.db, record_ids).await {
        Ok(refs) => refs,
        Err(e) => {
            tracing::error!(error = %e, "Failed to fetch blob references");
            return 0;
        }
    };

    delete_blobs(state, &refs).await;

    match queries::delete_records(&state.db, record_ids).await {
        Ok(deleted) => {
            tracing::info!(attempted = record_ids.len(), deleted, "Records deleted");
            metrics::counter!("records_retention_deleted_total").increment(deleted);
            deleted
        }
        Err(e) => {
            tracing::error!(error = %e, "Record deletion failed");
            0
        }
    }
}

/// Delete jobs: the blobs of every owned record first, then the job
/// rows (records and claims go with them via FK cascade).
async fn delete_job_set(state: &AppState, job_ids: &[Uuid]) -> u64 {
    if job_ids.is_empty() {
        return 0;
    }

    let refs = match queries::record_blob_refs_for_jobs(&state.db, job_ids).await {
        Ok(refs) => refs,
        Err(e) => {
            tracing::error!(error = %e, "Failed to fetch blob references for jobs");
            return 0;
        }
    };

    delete_blobs(state, &refs).await;

    match queries::delete_jobs(&state.db, job_ids).await {
        Ok(deleted) => {
            tracing::info!(attempted = job_ids.len(), deleted, "Jobs deleted");
            metrics::counter!("jobs_retention_deleted_total").increment(deleted);
            deleted
        }
        Err(e) => {
            tracing::error!(error = %e, "Job deletion failed");
            0
        }
    }
}

async fn delete_blobs(state: &AppState, refs: &[queries::RecordBlobRefs]) {
    for r in refs {
        if let Err(e) = state.storage.delete(&r.store_name, &r.original_key).await {
            tracing::warn!(
                record_id = %r.record_id,
                key = %r.original_key,
                error = %e,
                "Failed to delete original blob"
            );
        }
        if let Some(annotated) = &r.annotated_key {
            if let Err(e) = state.storage.delete(&r.store_name, annotated).await {
                tracing::warn!(
                    record_id = %r.record_id,
                    key = %annotated,
                    error = %e,
                    "Failed to delete annotated blob"
                );
            }
        }
    }
}
