//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Optional OpenAPI document (disable with `CHESSTRAL_ENABLE_OPENAPI=false`)
//! - Root status message and health route
//! - Chat completions at `/chat/completions` and under the OpenAI-style `/v1`

pub mod doc;
mod health;
mod root;
mod v1;

use axum::{Json, Router, middleware, routing::get};
use std::sync::Arc;
use tower::ServiceBuilder;

use crate::middleware::{cors, trace};
use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(root::router())
        .merge(health::router())
        .merge(v1::chat::router())
        .nest("/v1", v1::router());

    if state.config.enable_openapi {
        let api_doc = doc::get_docs();
        app = app.route(
            "/api-docs/openapi.json",
            get(move || async move { Json(api_doc) }),
        );
    }

    app
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(&state.config)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
