use axum::{
    body::{Body, HttpBody},
    extract::Request,
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::{BodyExt, Limited};
use std::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::ServerError;

pub static X_TRACE_ID: &str = "x-trace-id";

/// Bodies up to this size are buffered and logged verbatim.
const MAX_LOGGED_BODY: usize = 1024;

/// Per-request span with a trace id taken from (or added to) `x-trace-id`.
///
/// Small JSON bodies are buffered and logged; larger bodies and event
/// streams pass through untouched.
pub async fn trace_middleware(req: Request<Body>, next: Next) -> Response {
    let start_time = Instant::now();

    let trace_id = req
        .headers()
        .get(X_TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    let trace_header = HeaderValue::from_str(&trace_id.to_string()).ok();

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = info_span!(
        "http_request",
        trace_id = %trace_id,
        method = %method,
        path = %path,
    );

    async move {
        info!("→ request started");
        let (parts, body) = req.into_parts();
        let body = match log_if_json("request", &parts.headers, body).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to read request body");
                return ServerError::BadRequest("failed to read request body".into())
                    .into_response();
            }
        };
        let mut req = Request::from_parts(parts, body);
        if let Some(value) = &trace_header {
            req.headers_mut().insert(X_TRACE_ID, value.clone());
        }

        let response = next.run(req).await;

        let (parts, body) = response.into_parts();
        let body = log_if_json("response", &parts.headers, body)
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "failed to read response body");
                Body::empty()
            });
        let mut response = Response::from_parts(parts, body);
        if let Some(value) = trace_header {
            response.headers_mut().insert(X_TRACE_ID, value);
        }

        info!(
            status = response.status().as_u16(),
            latency_ms = start_time.elapsed().as_millis(),
            "← response finished"
        );

        response
    }
    .instrument(span)
    .await
}

/// Buffer and log a small JSON body; anything else is returned unread.
///
/// Only bodies whose exact length is known and within [`MAX_LOGGED_BODY`]
/// are buffered.
async fn log_if_json(direction: &str, headers: &HeaderMap, body: Body) -> Result<Body, axum::BoxError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));
    if !is_json {
        return Ok(body);
    }

    match body.size_hint().exact() {
        Some(len) if len <= MAX_LOGGED_BODY as u64 => {}
        Some(len) => {
            info!("{direction} body: [skipped, {len} bytes]");
            return Ok(body);
        }
        None => {
            info!("{direction} body: [skipped, unknown length]");
            return Ok(body);
        }
    }

    let bytes = Limited::new(body, MAX_LOGGED_BODY).collect().await?.to_bytes();
    if let Ok(text) = std::str::from_utf8(&bytes) {
        info!("{direction} body: {text}");
    }
    Ok(Body::from(bytes))
}
