//! Response types for `GET /v1/models`.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One servable model.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelCard {
    pub id: String,
    /// Always `"model"`.
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelCard {
    pub fn new(id: &str, created: i64) -> Self {
        Self {
            id: id.to_owned(),
            object: "model".into(),
            created,
            owned_by: "chesstral".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelList {
    /// Always `"list"`.
    pub object: String,
    pub data: Vec<ModelCard>,
}
