//! OpenAI-compatible chat-completion route.
//!
//! The conversation is validated and encoded on the request task, then
//! queued on the single inference worker. Non-streaming requests wait for
//! the full reply; streaming requests forward text deltas as server-sent
//! events. Dropping the response (client disconnect or timeout) drops the
//! event receiver, which cancels the generation at the next token.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chesstral_core::{FinishReason, GenerationEvent, GenerationStream, Role, collect_completion};
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use utoipa::OpenApi;
use uuid::Uuid;
use validator::Validate;

use crate::error::ServerError;
use crate::schemas::v1::chat::{
    ChatChoice, ChatChunkChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChatDelta, ChatMessage, Usage,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(chat_completions),
    components(schemas(
        ChatCompletionRequest,
        ChatCompletionResponse,
        ChatCompletionChunk,
        ChatChunkChoice,
        ChatDelta,
        ChatMessage,
        ChatChoice,
        Usage
    ))
)]
pub struct ChatApi;

/// Register chat-completion routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

// ── Chat completions ──────────────────────────────────────────────────────────

/// Chat completion (`POST /chat/completions`, also under `/v1`).
///
/// When `stream: true`, the reply is streamed using SSE and terminated by
/// `data: [DONE]`.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "chat",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = ChatCompletionResponse),
        (status = 400, description = "Invalid request"),
        (status = 503, description = "Inference queue full"),
        (status = 504, description = "Generation timed out"),
        (status = 500, description = "Inference failure"),
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ServerError> {
    let Json(req) = payload?;
    req.validate()?;

    let limit = state.config.max_tokens_limit;
    if req.max_tokens() > limit {
        return Err(ServerError::BadRequest(format!(
            "invalid max_tokens ({}): must be at most {limit}",
            req.max_tokens()
        )));
    }

    let params = req.sampling_params()?;
    let messages = req.conversation();
    let prompt = state.engine.prepare(&messages, &params)?;
    let prompt_tokens = prompt.len();
    debug!(
        model = req.model(),
        messages = messages.len(),
        prompt_tokens,
        max_tokens = params.max_tokens,
        stream = req.stream(),
        "chat completion request"
    );

    let deadline = state.config.request_timeout.map(|t| (Instant::now() + t, t));
    let events = state.engine.generate_stream(prompt, params)?;
    let meta = CompletionMeta {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        created: Utc::now().timestamp(),
        model: req.model().to_owned(),
    };

    if req.stream() {
        let stream = sse_events(events, meta, deadline);
        return Ok(Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let collect = collect_completion(events, prompt_tokens);
    let reply = match deadline {
        Some((at, timeout)) => tokio::time::timeout_at(at, collect)
            .await
            .map_err(|_| ServerError::Timeout(timeout))??,
        None => collect.await?,
    };
    let usage = Usage {
        prompt_tokens,
        completion_tokens: reply.completion_tokens,
        total_tokens: reply.total_tokens(),
    };
    info!(
        model = %meta.model,
        prompt_tokens,
        completion_tokens = usage.completion_tokens,
        finish_reason = %reply.finish_reason,
        "chat completion done"
    );

    let resp = ChatCompletionResponse {
        id: meta.id,
        object: "chat.completion".into(),
        created: meta.created,
        model: meta.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content: reply.text,
            },
            finish_reason: reply.finish_reason.to_string(),
        }],
        usage,
    };
    Ok(Json(resp).into_response())
}

/// Identity shared by every chunk of one completion.
#[derive(Debug, Clone)]
struct CompletionMeta {
    id: String,
    created: i64,
    model: String,
}

impl CompletionMeta {
    fn chunk(&self, delta: ChatDelta, finish: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk::new(&self.id, self.created, &self.model, delta, finish)
    }
}

/// Receive the next stream event, giving up at `deadline`.
async fn next_event(
    events: &mut GenerationStream,
    deadline: Option<(Instant, Duration)>,
) -> Result<Option<GenerationEvent>, ServerError> {
    match deadline {
        Some((at, timeout)) => tokio::time::timeout_at(at, events.recv())
            .await
            .map_err(|_| ServerError::Timeout(timeout)),
        None => Ok(events.recv().await),
    }
}

// ── Streaming ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Role,
    Content,
    Done,
    Finished,
}

struct SseState {
    events: GenerationStream,
    meta: CompletionMeta,
    deadline: Option<(Instant, Duration)>,
    phase: Phase,
}

fn json_event<T: Serialize>(value: &T) -> Event {
    Event::default().json_data(value).unwrap_or_else(|e| {
        error!(error = %e, "failed to serialise SSE payload");
        Event::default().data("{}")
    })
}

/// Role chunk, one chunk per text delta, a finish chunk, then `[DONE]`.
///
/// A failure after the stream has started is sent as a final error payload.
fn sse_events(
    events: GenerationStream,
    meta: CompletionMeta,
    deadline: Option<(Instant, Duration)>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = SseState {
        events,
        meta,
        deadline,
        phase: Phase::Role,
    };
    futures::stream::unfold(state, |mut s| async move {
        let event = match s.phase {
            Phase::Role => {
                s.phase = Phase::Content;
                let delta = ChatDelta {
                    role: Some(Role::Assistant),
                    content: None,
                };
                json_event(&s.meta.chunk(delta, None))
            }
            Phase::Content => match next_event(&mut s.events, s.deadline).await {
                Ok(Some(GenerationEvent::Delta(text))) => {
                    let delta = ChatDelta {
                        role: None,
                        content: Some(text),
                    };
                    json_event(&s.meta.chunk(delta, None))
                }
                Ok(Some(GenerationEvent::Done {
                    finish_reason,
                    completion_tokens,
                    ..
                })) => {
                    info!(id = %s.meta.id, completion_tokens, %finish_reason, "chat stream done");
                    s.phase = Phase::Done;
                    json_event(&s.meta.chunk(ChatDelta::default(), Some(finish_reason)))
                }
                Ok(Some(GenerationEvent::Error(message))) => {
                    s.phase = Phase::Finished;
                    let err = ServerError::from(chesstral_core::EngineError::Generation(message));
                    json_event(&err.body())
                }
                Ok(None) => {
                    s.phase = Phase::Finished;
                    let err = ServerError::from(chesstral_core::EngineError::WorkerShutdown);
                    json_event(&err.body())
                }
                Err(err) => {
                    warn!(id = %s.meta.id, "chat stream timed out");
                    s.phase = Phase::Finished;
                    json_event(&err.body())
                }
            },
            Phase::Done => {
                s.phase = Phase::Finished;
                Event::default().data("[DONE]")
            }
            Phase::Finished => return None,
        };
        Some((Ok::<Event, Infallible>(event), s))
    })
}
