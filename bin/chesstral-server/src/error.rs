//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] and renders the OpenAI error envelope:
//!
//! ```json
//! {"error": {"message": "...", "type": "invalid_request_error", "code": "..."}}
//! ```
//!
//! Internal failures are logged with full detail; the client only sees a
//! generic message.

use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chesstral_core::EngineError;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the inference engine.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// No result within the configured request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// `(status, type, code, client message)` for an error.
struct ErrorParts {
    status: StatusCode,
    kind: &'static str,
    code: &'static str,
    message: String,
}

impl ErrorParts {
    fn new(status: StatusCode, kind: &'static str, code: &'static str, message: String) -> Self {
        Self {
            status,
            kind,
            code,
            message,
        }
    }

    fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal_error",
            "internal server error".to_owned(),
        )
    }

    fn body(&self) -> Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.code,
            }
        })
    }
}

impl ServerError {
    fn parts(&self) -> ErrorParts {
        match self {
            ServerError::BadRequest(m) => ErrorParts::new(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
                m.clone(),
            ),
            ServerError::NotFound(m) => ErrorParts::new(
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "not_found",
                m.clone(),
            ),
            ServerError::Timeout(after) => ErrorParts::new(
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                "request_timeout",
                format!("generation did not finish within {}s", after.as_secs_f32()),
            ),
            ServerError::Engine(e) => engine_parts(e),
        }
    }

    /// The JSON error envelope, for places that cannot return a response
    /// (an already started event stream).
    pub fn body(&self) -> Value {
        self.parts().body()
    }
}

fn engine_parts(e: &EngineError) -> ErrorParts {
    let invalid = |code| {
        ErrorParts::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            code,
            e.to_string(),
        )
    };
    match e {
        EngineError::InvalidConversation(_) => invalid("invalid_messages"),
        EngineError::ContextLengthExceeded { .. } => invalid("context_length_exceeded"),
        EngineError::InvalidSampling(_) => invalid("invalid_sampling"),
        EngineError::QueueFull { .. } => {
            warn!(error = %e, "rejecting request");
            ErrorParts::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "server_busy",
                "queue_full",
                "server is busy, retry later".to_owned(),
            )
        }
        _ => {
            error!(error = %e, "inference engine error");
            ErrorParts::internal()
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let parts = self.parts();
        (parts.status, Json(parts.body())).into_response()
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl From<validator::ValidationErrors> for ServerError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ServerError::BadRequest(errors.to_string())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
