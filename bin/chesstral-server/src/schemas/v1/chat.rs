//! OpenAI-compatible chat-completion request / response types.
//!
//! Field names and defaults follow the OpenAI REST API so existing SDK
//! clients work unchanged.

use std::collections::HashMap;

use chesstral_core::{FinishReason, Role, SamplingParams};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::config::DEFAULT_MODEL_NAME;
use crate::error::ServerError;

// ── Chat Completions ─────────────────────────────────────────────────────────

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    /// `"system"`, `"user"` or `"assistant"`.
    #[schema(value_type = String, example = "user")]
    pub role: Role,
    pub content: String,
}

impl From<ChatMessage> for chesstral_core::ChatMessage {
    fn from(message: ChatMessage) -> Self {
        chesstral_core::ChatMessage::new(message.role, message.content)
    }
}

/// Request body for `POST /chat/completions`.
///
/// Optional parameters accept an explicit `null`, which means the default.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct ChatCompletionRequest {
    /// Echoed back in the response. Defaults to `"mistral-finetune"`.
    #[serde(default)]
    pub model: Option<String>,
    /// Conversation so far, oldest first.
    #[validate(length(min = 1, message = "messages must contain at least one message"))]
    pub messages: Vec<ChatMessage>,
    /// Defaults to `0.7`.
    #[serde(default)]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f64>,
    /// Defaults to `1.0`.
    #[serde(default)]
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub top_p: Option<f64>,
    /// Number of choices; only `1` is supported.
    #[serde(default)]
    #[validate(range(min = 1, max = 1, message = "only n = 1 is supported"))]
    pub n: Option<u32>,
    /// Stream the reply as server-sent events.
    #[serde(default)]
    pub stream: Option<bool>,
    /// Defaults to `64`.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    #[validate(range(min = -2.0, max = 2.0))]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    #[validate(range(min = -2.0, max = 2.0))]
    pub frequency_penalty: Option<f32>,
    /// Token id (as a string) to additive bias in `[-100, 100]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f32>>,
    /// Accepted for compatibility; ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_TOP_P: f64 = 1.0;
const DEFAULT_MAX_TOKENS: usize = 64;
const MAX_LOGIT_BIAS: f32 = 100.0;

impl ChatCompletionRequest {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL_NAME)
    }

    pub fn stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    /// Messages in the engine's representation.
    pub fn conversation(&self) -> Vec<chesstral_core::ChatMessage> {
        self.messages.iter().cloned().map(Into::into).collect()
    }

    pub fn sampling_params(&self) -> Result<SamplingParams, ServerError> {
        let logit_bias = self
            .logit_bias
            .iter()
            .flatten()
            .map(|(token, bias)| parse_logit_bias(token, *bias))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SamplingParams {
            max_tokens: self.max_tokens(),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: self.top_p.unwrap_or(DEFAULT_TOP_P),
            presence_penalty: self.presence_penalty.unwrap_or_default(),
            frequency_penalty: self.frequency_penalty.unwrap_or_default(),
            logit_bias,
            seed: self.seed,
        })
    }
}

fn parse_logit_bias(token: &str, bias: f32) -> Result<(u32, f32), ServerError> {
    let id = token
        .parse::<u32>()
        .map_err(|_| ServerError::BadRequest(format!("logit_bias key `{token}` is not a token id")))?;
    if !(-MAX_LOGIT_BIAS..=MAX_LOGIT_BIAS).contains(&bias) {
        return Err(ServerError::BadRequest(format!(
            "logit_bias for token {id} must be between -{MAX_LOGIT_BIAS} and {MAX_LOGIT_BIAS}"
        )));
    }
    Ok((id, bias))
}

/// A single choice in the completion response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatChoice {
    /// Always `0`.
    pub index: u32,
    pub message: ChatMessage,
    /// `"stop"` or `"length"`.
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Response body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionResponse {
    /// `chatcmpl-<uuid>`.
    pub id: String,
    /// Always `"chat.completion"`.
    pub object: String,
    /// Unix timestamp of when the response was created.
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

// ── Streaming ────────────────────────────────────────────────────────────────

/// Incremental message content in a stream chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatChunkChoice {
    pub index: u32,
    pub delta: ChatDelta,
    /// Set on the last chunk only.
    pub finish_reason: Option<String>,
}

/// One `data:` payload of a streamed completion.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionChunk {
    pub id: String,
    /// Always `"chat.completion.chunk"`.
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
}

impl ChatCompletionChunk {
    pub fn new(id: &str, created: i64, model: &str, delta: ChatDelta, finish: Option<FinishReason>) -> Self {
        Self {
            id: id.to_owned(),
            object: "chat.completion.chunk".into(),
            created,
            model: model.to_owned(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason: finish.map(|r| r.to_string()),
            }],
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn parse(body: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn defaults_match_openai() {
        let req = parse(json!({"messages": [{"role": "user", "content": "hi"}]}));
        assert_eq!(req.model(), DEFAULT_MODEL_NAME);
        assert_eq!(req.max_tokens(), 64);
        assert!(!req.stream());
        let params = req.sampling_params().unwrap();
        assert!((params.temperature - 0.7).abs() < f64::EPSILON);
        assert!((params.top_p - 1.0).abs() < f64::EPSILON);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn explicit_nulls_mean_defaults() {
        let req = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "model": null,
            "temperature": null,
            "top_p": null,
            "n": null,
            "stream": null,
            "max_tokens": null,
            "presence_penalty": null,
            "frequency_penalty": null,
            "logit_bias": null,
            "user": null,
            "seed": null,
        }));
        assert!(req.validate().is_ok());
        assert_eq!(req.model(), DEFAULT_MODEL_NAME);
        assert!(!req.stream());
        let params = req.sampling_params().unwrap();
        assert_eq!(params.max_tokens, 64);
        assert!((params.temperature - 0.7).abs() < f64::EPSILON);
        assert_eq!(params.presence_penalty, 0.0);
        assert!(params.logit_bias.is_empty());
    }

    #[test]
    fn unknown_role_fails_to_parse() {
        let parsed: Result<ChatCompletionRequest, _> =
            serde_json::from_value(json!({"messages": [{"role": "tool", "content": "x"}]}));
        assert!(parsed.is_err());
    }

    #[test]
    fn bounds_are_validated() {
        let empty = parse(json!({"messages": []}));
        assert!(empty.validate().is_err());

        let many = parse(json!({"messages": [{"role": "user", "content": "hi"}], "n": 2}));
        assert!(many.validate().is_err());

        let hot = parse(json!({"messages": [{"role": "user", "content": "hi"}], "temperature": 3.5}));
        assert!(hot.validate().is_err());

        let no_mass = parse(json!({"messages": [{"role": "user", "content": "hi"}], "top_p": 0.0}));
        assert!(no_mass.validate().is_err());
    }

    #[test]
    fn logit_bias_keys_are_token_ids() {
        let req = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"42": -100.0},
            "seed": 7,
        }));
        let params = req.sampling_params().unwrap();
        assert_eq!(params.logit_bias, vec![(42, -100.0)]);
        assert_eq!(params.seed, Some(7));

        let bad = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"e4": 1.0},
        }));
        assert!(matches!(bad.sampling_params(), Err(ServerError::BadRequest(_))));
    }

    #[test]
    fn logit_bias_values_are_bounded() {
        let huge = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"42": 1e39},
        }));
        assert!(matches!(huge.sampling_params(), Err(ServerError::BadRequest(_))));

        let edge = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"42": 100.0, "7": -100.0},
        }));
        assert_eq!(edge.sampling_params().unwrap().logit_bias.len(), 2);
    }

    #[test]
    fn roles_are_preserved() {
        let req = parse(json!({"messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
        ]}));
        let roles: Vec<Role> = req.conversation().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[test]
    fn chunk_omits_empty_delta_fields() {
        let chunk = ChatCompletionChunk::new("id", 0, "m", ChatDelta::default(), Some(FinishReason::Stop));
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["choices"][0]["delta"], json!({}));
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["object"], "chat.completion.chunk");
    }
}
