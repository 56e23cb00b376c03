use futures::future::join_all;
use leafscan::{
    app_state::AppState,
    config::AppConfig,
    db::{self, queries},
    models::job::JobStatus,
    services::{
        inference::InferenceClient, queue::DispatchQueue, retention, storage::ObjectStore,
    },
};
use uuid::Uuid;

/// Build shared state from environment configuration.
///
/// These tests require a running PostgreSQL, Redis and S3-compatible
/// store configured via environment variables, which is why they are
/// all `#[ignore]`-gated. Run with:
/// cargo test --test orchestration_test -- --ignored
async fn test_state() -> AppState {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let storage = ObjectStore::new(
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object store");

    let queue = DispatchQueue::new(&config.redis_url).expect("Failed to initialize queue");
    let inference = InferenceClient::new(&config.inference_url, &config.inference_api_token);

    AppState::new(db_pool, storage, queue, inference, config)
}

/// Concurrency property: 100 concurrent claim-then-increment item
/// completions against one job must account for exactly 100 items,
/// with no lost updates from racing increments.
#[tokio::test]
#[ignore]
async fn concurrent_counter_increments_do_not_lose_updates() {
    let state = test_state().await;

    let job = queries::create_job(&state.db, "test-store", "race/")
        .await
        .expect("Failed to create job");
    queries::set_total_found(&state.db, job.id, 100)
        .await
        .expect("Failed to set total");

    let tasks = (0..100).map(|i| {
        let db = state.db.clone();
        let job_id = job.id;
        async move {
            let key = format!("race/img_{i}.jpg");
            let claimed = queries::claim_item(&db, job_id, &key)
                .await
                .expect("claim failed");
            assert!(claimed, "first claim must win");
            if i % 2 == 0 {
                queries::increment_succeeded(&db, job_id).await.expect("increment failed");
            } else {
                queries::increment_failed(&db, job_id).await.expect("increment failed");
            }
        }
    });
    join_all(tasks).await;

    let job = queries::get_job(&state.db, job.id)
        .await
        .expect("fetch failed")
        .expect("job missing");
    assert_eq!(job.succeeded, 50);
    assert_eq!(job.failed, 50);
    assert_eq!(job.succeeded + job.failed, job.total_found);

    // Redelivered tasks lose the claim and must not count twice.
    let reclaimed = queries::claim_item(&state.db, job.id, "race/img_0.jpg")
        .await
        .expect("claim failed");
    assert!(!reclaimed);

    queries::delete_jobs(&state.db, &[job.id])
        .await
        .expect("cleanup failed");
}

/// Retention idempotence: a second count-based pass over unchanged
/// data deletes nothing.
#[tokio::test]
#[ignore]
async fn manual_count_retention_is_idempotent() {
    let state = test_state().await;
    let keep = state.config.manual_records_to_keep as usize;

    // Create keep + 5 ownerless records.
    for i in 0..keep + 5 {
        let results = serde_json::json!({ "detections": [] });
        queries::insert_record(
            &state.db,
            None,
            "test-store",
            &format!("uploads/retention_{i}_{}.jpg", Uuid::new_v4()),
            None,
            &results,
            None,
        )
        .await
        .expect("insert failed");
    }

    let first = retention::run_immediate_manual_cleanup(&state).await;
    assert!(first >= 5, "first pass must delete the excess");

    let second = retention::run_immediate_manual_cleanup(&state).await;
    assert_eq!(second, 0, "second pass must be a no-op");
}

/// Listing filter: zero-byte objects and non-image extensions never
/// appear in the dispatched set; they are filtered at list time, not
/// rejected at process time.
#[tokio::test]
#[ignore]
async fn listing_filters_empty_and_non_image_objects() {
    let state = test_state().await;
    let store = &state.config.default_store;
    let prefix = format!("listing-test/{}", Uuid::new_v4());

    let image_bytes = vec![0u8; 2048];
    state
        .storage
        .upload(store, &format!("{prefix}/good_1.jpg"), &image_bytes, "image/jpeg")
        .await
        .expect("upload failed");
    state
        .storage
        .upload(store, &format!("{prefix}/good_2.PNG"), &image_bytes, "image/png")
        .await
        .expect("upload failed");
    state
        .storage
        .upload(store, &format!("{prefix}/notes.txt"), b"not an image", "text/plain")
        .await
        .expect("upload failed");
    state
        .storage
        .upload(store, &format!("{prefix}/empty.jpg"), &[], "image/jpeg")
        .await
        .expect("upload failed");

    let keys = state
        .storage
        .list_images(store, &prefix)
        .await
        .expect("listing failed");

    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|k| !k.ends_with(".txt")));
    assert!(keys.iter().all(|k| !k.ends_with("empty.jpg")));

    for key in [
        format!("{prefix}/good_1.jpg"),
        format!("{prefix}/good_2.PNG"),
        format!("{prefix}/notes.txt"),
        format!("{prefix}/empty.jpg"),
    ] {
        state.storage.delete(store, &key).await.expect("cleanup failed");
    }
}

/// An undersized but non-empty object passes the listing filter, gets
/// downloaded, and is rejected as too small, counted as a failure.
#[tokio::test]
#[ignore]
async fn undersized_object_is_rejected_and_counted_failed() {
    use leafscan::models::record::{FailureKind, OutcomeStatus};
    use leafscan::services::processor;

    let state = test_state().await;
    let store = state.config.default_store.clone();
    let prefix = format!("toosmall/{}", Uuid::new_v4());
    let key = format!("{prefix}/tiny.jpg");

    // 500 bytes: non-empty, so the listing filter admits it, but below
    // the 1024-byte processing minimum.
    state
        .storage
        .upload(&store, &key, &vec![0u8; 500], "image/jpeg")
        .await
        .expect("upload failed");

    let job = queries::create_job(&state.db, &store, &prefix)
        .await
        .expect("Failed to create job");
    queries::claim_job_for_dispatch(&state.db, job.id)
        .await
        .expect("claim failed");
    queries::set_total_found(&state.db, job.id, 1)
        .await
        .expect("set total failed");

    let outcome = processor::process_object(&state, &store, &key, Some(job.id)).await;
    assert_eq!(outcome.status, OutcomeStatus::Failure);
    assert_eq!(outcome.failure_kind, Some(FailureKind::TooSmall));
    assert!(outcome.error.is_some());

    let job = queries::get_job(&state.db, job.id)
        .await
        .expect("fetch failed")
        .expect("job missing");
    assert_eq!(job.failed, 1);
    assert_eq!(job.succeeded, 0);

    state.storage.delete(&store, &key).await.expect("cleanup failed");
    queries::delete_jobs(&state.db, &[job.id])
        .await
        .expect("cleanup failed");
}

/// A dispatch command released after a failed handling attempt goes
/// back on the queue and is delivered again; an acknowledged command
/// is gone for good.
#[tokio::test]
#[ignore]
async fn released_dispatch_command_is_redelivered() {
    use leafscan::services::queue::DispatchCommand;

    let state = test_state().await;
    let command = DispatchCommand {
        job_id: Uuid::new_v4(),
        store_name: "test-store".to_string(),
        prefix: format!("release/{}", Uuid::new_v4()),
    };

    state.queue.enqueue(&command).await.expect("enqueue failed");

    let first = state
        .queue
        .dequeue()
        .await
        .expect("dequeue failed")
        .expect("command missing");
    assert_eq!(first.job_id, command.job_id);

    // Handling failed: the command must come back instead of being lost.
    state.queue.release(&first).await.expect("release failed");

    let second = state
        .queue
        .dequeue()
        .await
        .expect("dequeue failed")
        .expect("released command was not redelivered");
    assert_eq!(second.job_id, command.job_id);

    state.queue.complete(&second).await.expect("complete failed");
    let drained = state.queue.dequeue().await.expect("dequeue failed");
    assert!(drained.is_none(), "acknowledged command must not reappear");
}

/// A pending job is claimable exactly once; the second dispatch
/// delivery is dropped.
#[tokio::test]
#[ignore]
async fn dispatch_claim_is_exactly_once() {
    let state = test_state().await;

    let job = queries::create_job(&state.db, "test-store", "claim/")
        .await
        .expect("Failed to create job");
    assert_eq!(job.status, JobStatus::Pending);

    let first = queries::claim_job_for_dispatch(&state.db, job.id)
        .await
        .expect("claim failed");
    let second = queries::claim_job_for_dispatch(&state.db, job.id)
        .await
        .expect("claim failed");

    assert!(first);
    assert!(!second);

    let job = queries::get_job(&state.db, job.id)
        .await
        .expect("fetch failed")
        .expect("job missing");
    assert_eq!(job.status, JobStatus::Processing);

    queries::delete_jobs(&state.db, &[job.id])
        .await
        .expect("cleanup failed");
}

/// Finalized counters must satisfy succeeded + failed == total_found
/// and a terminal status consistent with them.
#[tokio::test]
#[ignore]
async fn finalize_writes_consistent_terminal_state() {
    use leafscan::models::record::{FailureKind, ItemOutcome, OutcomeStatus};
    use leafscan::services::aggregator;

    let state = test_state().await;

    let job = queries::create_job(&state.db, "test-store", "finalize/")
        .await
        .expect("Failed to create job");
    queries::claim_job_for_dispatch(&state.db, job.id)
        .await
        .expect("claim failed");
    queries::set_total_found(&state.db, job.id, 3)
        .await
        .expect("set total failed");

    let outcomes = vec![
        ItemOutcome {
            status: OutcomeStatus::Success,
            item_key: "finalize/a.jpg".to_string(),
            record_id: None,
            class_counts: [("gray mold".to_string(), 1)].into_iter().collect(),
            severity_score: Some(0.75),
            original_url: None,
            annotated_url: None,
            error: None,
            failure_kind: None,
        },
        ItemOutcome {
            status: OutcomeStatus::Success,
            item_key: "finalize/b.jpg".to_string(),
            record_id: None,
            class_counts: Default::default(),
            severity_score: None,
            original_url: None,
            annotated_url: None,
            error: None,
            failure_kind: None,
        },
        ItemOutcome::failure("finalize/c.jpg", FailureKind::TooSmall, "too small"),
    ];

    aggregator::finalize(&state, job.id, &outcomes).await;

    let job = queries::get_job(&state.db, job.id)
        .await
        .expect("fetch failed")
        .expect("job missing");
    assert_eq!(job.status, JobStatus::PartiallyCompleted);
    assert_eq!(job.succeeded, 2);
    assert_eq!(job.failed, 1);
    assert_eq!(job.succeeded + job.failed, job.total_found);

    let summary = job.summary.expect("summary missing");
    assert_eq!(summary["detected_classes_summary"]["gray mold"], 1);
    assert_eq!(summary["average_severity_score"], 0.75);

    queries::delete_jobs(&state.db, &[job.id])
        .await
        .expect("cleanup failed");
}
