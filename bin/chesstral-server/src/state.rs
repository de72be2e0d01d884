//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use chesstral_core::ChatEngine;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Handle to the single inference worker.
    pub engine: ChatEngine,
    /// Unix timestamp of startup, reported as the model's `created` time.
    pub started_at: i64,
}

impl AppState {
    pub fn new(config: Config, engine: ChatEngine) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            started_at: chrono::Utc::now().timestamp(),
        }
    }
}
