use leafscan::{
    app_state::AppState,
    config::AppConfig,
    db,
    services::{
        dispatcher, inference::InferenceClient, queue::DispatchQueue, retention,
        storage::ObjectStore,
    },
};
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting leafscan batch worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let storage = ObjectStore::new(
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object store client");

    let queue = DispatchQueue::new(&config.redis_url).expect("Failed to initialize dispatch queue");

    let inference = InferenceClient::new(&config.inference_url, &config.inference_api_token);

    let cleanup_interval = Duration::from_secs(config.cleanup_interval_secs);
    let state = AppState::new(db_pool, storage, queue, inference, config);

    // Scheduled retention clock, independent of the dispatch loop.
    let retention_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup does not
        // race a half-initialized deployment.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let summary = retention::run_scheduled_cleanup(&retention_state).await;
            tracing::info!(summary = ?summary, "Scheduled cleanup finished");
        }
    });

    tracing::info!("Worker ready, starting dispatch loop");

    // Main processing loop
    loop {
        match process_next_command(&state).await {
            Ok(true) => {
                tracing::debug!("Dispatch handled, checking for next command");
            }
            Ok(false) => {
                tracing::trace!("No dispatch commands available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error handling dispatch command, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Handle the next dispatch command from the queue.
/// Returns Ok(true) if a command was handled, Ok(false) if none available.
async fn process_next_command(state: &AppState) -> Result<bool, Box<dyn std::error::Error>> {
    let command = match state.queue.dequeue().await? {
        Some(c) => c,
        None => return Ok(false),
    };

    tracing::info!(
        job_id = %command.job_id,
        store = %command.store_name,
        prefix = %command.prefix,
        "Handling batch dispatch"
    );

    if let Err(e) = dispatcher::run_dispatch(state, command.job_id, &command.store_name, &command.prefix)
        .await
    {
        tracing::error!(job_id = %command.job_id, error = %e, "Dispatch failed, releasing command");
        // A failure before the job claim (e.g. the claim query itself
        // hitting a DB outage) must not strand the job in pending, so
        // the command goes back for redelivery instead of being acked.
        // If the claim already went through, the redelivery is a no-op.
        state.queue.release(&command).await?;
        return Err(Box::new(e));
    }

    // Acknowledge only after the batch is fully dispatched and
    // finalized; a crash before this leaves the command in the
    // processing list for redelivery, where the job claim makes the
    // redelivery a no-op.
    state.queue.complete(&command).await?;
    tracing::info!(job_id = %command.job_id, "Dispatch command completed");
    Ok(true)
}
