use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use utoipa::OpenApi;

use crate::state::AppState;

pub const ROOT_MESSAGE: &str = "Mistral Local API is running. Send requests to /chat/completions";

#[derive(OpenApi)]
#[openapi(paths(get_root))]
pub struct RootApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_root))
}

/// Liveness message; query parameters are ignored.
#[utoipa::path(
    get,
    path = "/",
    tag = "health",
    responses((status = 200, description = "Server is running", body = Value))
)]
pub async fn get_root() -> Json<Value> {
    Json(json!({ "message": ROOT_MESSAGE }))
}
