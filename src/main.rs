mod app_state;
mod config;
mod db;
mod models;
mod routes;
mod services;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use services::{inference::InferenceClient, queue::DispatchQueue, storage::ObjectStore};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing leafscan server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("batches_submitted_total", "Total batch jobs submitted");
    metrics::describe_counter!("batches_dispatched_total", "Total batch jobs dispatched");
    metrics::describe_counter!("batches_finalized_total", "Total batch jobs finalized");
    metrics::describe_counter!("items_processed_total", "Total images processed successfully");
    metrics::describe_counter!("items_failed_total", "Total images that failed processing");
    metrics::describe_histogram!(
        "item_processing_seconds",
        "Time to process a single image"
    );
    metrics::describe_counter!(
        "records_retention_deleted_total",
        "Detection records removed by retention"
    );
    metrics::describe_counter!(
        "jobs_retention_deleted_total",
        "Batch jobs removed by retention"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize object store client
    tracing::info!("Initializing object store client");
    let storage = ObjectStore::new(
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object store client");

    // Initialize Redis dispatch queue
    tracing::info!("Connecting to Redis dispatch queue");
    let queue = DispatchQueue::new(&config.redis_url).expect("Failed to initialize dispatch queue");

    // Initialize inference client
    tracing::info!("Initializing inference client");
    let inference = InferenceClient::new(&config.inference_url, &config.inference_api_token);

    // Create shared application state
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(db_pool, storage, queue, inference, config);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/batches", post(routes::batches::submit_batch))
        .route(
            "/api/v1/batches/{job_id}",
            get(routes::batches::get_batch_status),
        )
        .route("/api/v1/detect", post(routes::detect::detect_image))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)); // 10 MB limit

    tracing::info!("Starting leafscan on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
