//! Model listing (`GET /v1/models`).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::models::{ModelCard, ModelList};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_models, get_model), components(schemas(ModelCard, ModelList)))]
pub struct ModelsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/{model}", get(get_model))
}

/// The single model this server hosts.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses((status = 200, description = "Served models", body = ModelList))
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list".into(),
        data: vec![ModelCard::new(&state.config.model_name, state.started_at)],
    })
}

#[utoipa::path(
    get,
    path = "/v1/models/{model}",
    tag = "models",
    params(("model" = String, Path, description = "Model id")),
    responses(
        (status = 200, description = "Model found", body = ModelCard),
        (status = 404, description = "Unknown model"),
    )
)]
pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Result<Json<ModelCard>, ServerError> {
    if model != state.config.model_name {
        return Err(ServerError::NotFound(format!("model `{model}` does not exist")));
    }
    Ok(Json(ModelCard::new(&model, state.started_at)))
}
