use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{BatchJob, JobStatus};
use crate::models::record::DetectionRecord;

fn job_from_row(row: &PgRow) -> Result<BatchJob, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str).unwrap_or(JobStatus::Pending);

    Ok(BatchJob {
        id: row.try_get("id")?,
        status,
        store_name: row.try_get("store_name")?,
        prefix: row.try_get("prefix")?,
        total_found: row.try_get("total_found")?,
        succeeded: row.try_get("succeeded")?,
        failed: row.try_get("failed")?,
        summary: row.try_get("summary")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const JOB_COLUMNS: &str = "id, status, store_name, prefix, total_found, succeeded, failed, \
                           summary, error, created_at, updated_at";

/// Insert a new batch job in `pending` state.
pub async fn create_job(
    pool: &PgPool,
    store_name: &str,
    prefix: &str,
) -> Result<BatchJob, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO batch_jobs (status, store_name, prefix)
        VALUES ('pending', $1, $2)
        RETURNING {JOB_COLUMNS}
        "#,
    ))
    .bind(store_name)
    .bind(prefix)
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<BatchJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM batch_jobs
        WHERE id = $1
        "#,
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Claim a pending job for dispatch, moving it to `processing`.
///
/// Returns false if the job was already claimed (or is not pending),
/// which is how a redelivered dispatch command gets dropped.
pub async fn claim_job_for_dispatch(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE batch_jobs
        SET status = 'processing', updated_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Record the number of listed items. Written once, before any item
/// task is dispatched, so there is no contention on this field.
pub async fn set_total_found(pool: &PgPool, job_id: Uuid, total: i32) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE batch_jobs
        SET total_found = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(total)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a job failed with an error message.
pub async fn mark_job_failed(pool: &PgPool, job_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE batch_jobs
        SET status = 'failed', error = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(error)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Finalize a job: counters, summary, status and error in one update.
pub async fn finalize_job(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
    succeeded: i32,
    failed: i32,
    summary: &serde_json::Value,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE batch_jobs
        SET status = $1,
            succeeded = $2,
            failed = $3,
            summary = $4,
            error = COALESCE($5, error),
            updated_at = NOW()
        WHERE id = $6
        "#,
    )
    .bind(status.to_string())
    .bind(succeeded)
    .bind(failed)
    .bind(summary)
    .bind(error)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Claim the (job, item) idempotency key ahead of a counter increment.
///
/// Returns true only for the first claimant; a redelivered item task
/// loses the claim and must not increment again.
pub async fn claim_item(pool: &PgPool, job_id: Uuid, item_key: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO batch_item_claims (batch_job_id, item_key)
        VALUES ($1, $2)
        ON CONFLICT (batch_job_id, item_key) DO NOTHING
        "#,
    )
    .bind(job_id)
    .bind(item_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Atomic relative increment of the succeeded counter. Never a
/// read-modify-write: item tasks run N-way concurrent.
pub async fn increment_succeeded(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE batch_jobs
        SET succeeded = succeeded + 1, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Atomic relative increment of the failed counter.
pub async fn increment_failed(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE batch_jobs
        SET failed = failed + 1, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

fn record_from_row(row: &PgRow) -> Result<DetectionRecord, sqlx::Error> {
    Ok(DetectionRecord {
        id: row.try_get("id")?,
        batch_job_id: row.try_get("batch_job_id")?,
        store_name: row.try_get("store_name")?,
        original_key: row.try_get("original_key")?,
        annotated_key: row.try_get("annotated_key")?,
        results: row.try_get("results")?,
        severity_score: row.try_get("severity_score")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

/// Insert a detection record in a single write.
#[allow(clippy::too_many_arguments)]
pub async fn insert_record(
    pool: &PgPool,
    batch_job_id: Option<Uuid>,
    store_name: &str,
    original_key: &str,
    annotated_key: Option<&str>,
    results: &serde_json::Value,
    severity_score: Option<f64>,
) -> Result<DetectionRecord, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO detection_records
            (batch_job_id, store_name, original_key, annotated_key, results, severity_score)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, batch_job_id, store_name, original_key, annotated_key, results,
                  severity_score, uploaded_at
        "#,
    )
    .bind(batch_job_id)
    .bind(store_name)
    .bind(original_key)
    .bind(annotated_key)
    .bind(results)
    .bind(severity_score)
    .fetch_one(pool)
    .await?;

    record_from_row(&row)
}

/// Blob references (store, original key, optional annotated key) for a
/// set of records, fetched before the rows are deleted.
pub struct RecordBlobRefs {
    pub record_id: Uuid,
    pub store_name: String,
    pub original_key: String,
    pub annotated_key: Option<String>,
}

fn blob_refs_from_rows(rows: Vec<PgRow>) -> Result<Vec<RecordBlobRefs>, sqlx::Error> {
    rows.iter()
        .map(|r| {
            Ok(RecordBlobRefs {
                record_id: r.try_get("id")?,
                store_name: r.try_get("store_name")?,
                original_key: r.try_get("original_key")?,
                annotated_key: r.try_get("annotated_key")?,
            })
        })
        .collect()
}

/// Ownerless (manual) record IDs beyond the newest `keep`, oldest last.
pub async fn manual_record_ids_beyond(
    pool: &PgPool,
    keep: i64,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id
        FROM detection_records
        WHERE batch_job_id IS NULL
        ORDER BY uploaded_at DESC
        OFFSET $1
        "#,
    )
    .bind(keep)
    .fetch_all(pool)
    .await?;

    rows.iter().map(|r| r.try_get("id")).collect()
}

/// Ownerless record IDs older than the cutoff.
pub async fn manual_record_ids_older_than(
    pool: &PgPool,
    cutoff: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id
        FROM detection_records
        WHERE batch_job_id IS NULL AND uploaded_at < $1
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    rows.iter().map(|r| r.try_get("id")).collect()
}

/// Non-pending job IDs older than the cutoff.
pub async fn job_ids_older_than(
    pool: &PgPool,
    cutoff: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id
        FROM batch_jobs
        WHERE status <> 'pending' AND created_at < $1
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    rows.iter().map(|r| r.try_get("id")).collect()
}

/// Non-pending job IDs beyond the newest `keep`, oldest last.
pub async fn job_ids_beyond(pool: &PgPool, keep: i64) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id
        FROM batch_jobs
        WHERE status <> 'pending'
        ORDER BY created_at DESC
        OFFSET $1
        "#,
    )
    .bind(keep)
    .fetch_all(pool)
    .await?;

    rows.iter().map(|r| r.try_get("id")).collect()
}

/// Blob references for a set of records.
pub async fn record_blob_refs(
    pool: &PgPool,
    record_ids: &[Uuid],
) -> Result<Vec<RecordBlobRefs>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, store_name, original_key, annotated_key
        FROM detection_records
        WHERE id = ANY($1)
        "#,
    )
    .bind(record_ids)
    .fetch_all(pool)
    .await?;

    blob_refs_from_rows(rows)
}

/// Blob references for every record owned by the given jobs.
pub async fn record_blob_refs_for_jobs(
    pool: &PgPool,
    job_ids: &[Uuid],
) -> Result<Vec<RecordBlobRefs>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, store_name, original_key, annotated_key
        FROM detection_records
        WHERE batch_job_id = ANY($1)
        "#,
    )
    .bind(job_ids)
    .fetch_all(pool)
    .await?;

    blob_refs_from_rows(rows)
}

/// Bulk-delete records by ID, returning the number of rows removed.
pub async fn delete_records(pool: &PgPool, record_ids: &[Uuid]) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM detection_records
        WHERE id = ANY($1)
        "#,
    )
    .bind(record_ids)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Bulk-delete jobs by ID. Owned records and item claims go with them
/// via FK cascade; blobs must already have been deleted by the caller.
pub async fn delete_jobs(pool: &PgPool, job_ids: &[Uuid]) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM batch_jobs
        WHERE id = ANY($1)
        "#,
    )
    .bind(job_ids)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
