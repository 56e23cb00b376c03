//! Batch Dispatcher: fan out one item task per listed object, join all
//! outcomes, and hand them to the Aggregator exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::job::BatchSummary;
use crate::models::record::{FailureKind, ItemOutcome};
use crate::services::aggregator;
use crate::services::processor;
use crate::services::severity;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Run a dequeued dispatch command through to finalization.
///
/// The job row was created (pending) by the submitter; this claims it,
/// lists the prefix, fans out item tasks, joins them, and finalizes.
/// Listing failures mark the job failed after bounded retries; they do
/// not bubble out. Only unexpected database errors do.
pub async fn run_dispatch(
    state: &AppState,
    job_id: Uuid,
    store_name: &str,
    prefix: &str,
) -> Result<(), DispatchError> {
    // Conditional pending -> processing claim. A redelivered command
    // for an already-claimed job is dropped here, which is what makes
    // dispatch (and therefore finalization) exactly-once.
    if !queries::claim_job_for_dispatch(&state.db, job_id).await? {
        tracing::warn!(job_id = %job_id, "Job already dispatched, dropping command");
        return Ok(());
    }

    tracing::info!(job_id = %job_id, store = %store_name, prefix = %prefix, "Dispatching batch");
    metrics::counter!("batches_dispatched_total").increment(1);

    let keys = match list_with_retry(state, store_name, prefix).await {
        Ok(keys) => keys,
        Err(message) => {
            tracing::error!(job_id = %job_id, error = %message, "Listing failed, marking job failed");
            queries::mark_job_failed(&state.db, job_id, &message).await?;
            return Ok(());
        }
    };

    let total = keys.len();
    queries::set_total_found(&state.db, job_id, total as i32).await?;
    tracing::info!(job_id = %job_id, total, "Listing complete");

    if keys.is_empty() {
        let summary = BatchSummary {
            message: "No images found.".to_string(),
            detected_classes_summary: Default::default(),
            average_severity_score: None,
            recommendation: severity::recommendation(None),
        };
        queries::finalize_job(
            &state.db,
            job_id,
            crate::models::job::JobStatus::Completed,
            0,
            0,
            &serde_json::to_value(&summary).unwrap_or_default(),
            None,
        )
        .await?;
        tracing::info!(job_id = %job_id, "No items under prefix, job completed immediately");
        return Ok(());
    }

    let outcomes = fan_out(state, job_id, store_name, keys).await;

    // The join above is the barrier: every counter increment
    // happens-before this read of the outcome set.
    aggregator::finalize(state, job_id, &outcomes).await;

    Ok(())
}

/// Run one item task per key under the concurrency bound, each with a
/// hard wall-clock budget, and collect all outcomes.
async fn fan_out(
    state: &AppState,
    job_id: Uuid,
    store_name: &str,
    keys: Vec<String>,
) -> Vec<ItemOutcome> {
    let semaphore = Arc::new(Semaphore::new(state.config.max_concurrent_items.max(1)));
    let budget = Duration::from_secs(state.config.item_timeout_secs);
    let mut tasks = JoinSet::new();

    for key in keys {
        let state = state.clone();
        let store = store_name.to_string();
        let semaphore = Arc::clone(&semaphore);

        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore is never closed; keep the task total
                    // honest even if it somehow is.
                    return ItemOutcome::failure(
                        &key,
                        FailureKind::Internal,
                        "concurrency limiter closed",
                    );
                }
            };

            match timeout(budget, processor::process_object(&state, &store, &key, Some(job_id)))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(job_id = %job_id, key = %key, "Item task exceeded its time budget");
                    let outcome = ItemOutcome::failure(
                        &key,
                        FailureKind::Timeout,
                        format!("item task exceeded {}s", budget.as_secs()),
                    );
                    // The cancelled task may not have reached its own
                    // increment; the claim keeps this at-most-once.
                    processor::apply_counters(&state, job_id, &key, &outcome).await;
                    outcome
                }
            }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                // A panicked item task still counts as a failure so the
                // join condition (N outcomes) holds.
                tracing::error!(job_id = %job_id, error = %e, "Item task panicked");
                let outcome =
                    ItemOutcome::failure("<unknown>", FailureKind::Internal, e.to_string());
                outcomes.push(outcome);
            }
        }
    }

    outcomes
}

async fn list_with_retry(
    state: &AppState,
    store_name: &str,
    prefix: &str,
) -> Result<Vec<String>, String> {
    let attempts = state.config.listing_retries.max(1);
    let mut last_err = String::new();

    for attempt in 0..attempts {
        match state.storage.list_images(store_name, prefix).await {
            Ok(keys) => return Ok(keys),
            Err(e) => {
                tracing::warn!(
                    store = %store_name,
                    prefix = %prefix,
                    attempt = attempt + 1,
                    attempts,
                    error = %e,
                    "Listing failed"
                );
                last_err = e.to_string();
                if attempt + 1 < attempts {
                    sleep(Duration::from_secs(5 * (attempt as u64 + 1))).await;
                }
            }
        }
    }

    Err(last_err)
}
