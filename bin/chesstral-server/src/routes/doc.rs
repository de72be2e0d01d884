use crate::routes::{health, root, v1};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(info(
    title = "chesstral-server",
    description = "Local Mistral + LoRA chat-completion API",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.merge(root::RootApi::openapi());
    doc.merge(health::HealthApi::openapi());
    doc.merge(v1::api_docs());
    doc
}
