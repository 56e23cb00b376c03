use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{inference::InferenceClient, queue::DispatchQueue, storage::ObjectStore};

/// Shared application state passed to route handlers and tasks.
///
/// The inference client is constructed once at process start and
/// injected everywhere; nothing reaches for process-global model state.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub storage: Arc<ObjectStore>,
    pub queue: Arc<DispatchQueue>,
    pub inference: Arc<InferenceClient>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: ObjectStore,
        queue: DispatchQueue,
        inference: InferenceClient,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            storage: Arc::new(storage),
            queue: Arc::new(queue),
            inference: Arc::new(inference),
            config: Arc::new(config),
        }
    }
}
