use std::path::PathBuf;

use thiserror::Error;

/// All errors produced by the chesstral inference core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O error
    #[error("I/O error {0}")]
    Io(#[from] std::io::Error),

    #[error("Tensor operation failed: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("File not found: {path}")]
    MissingFile { path: PathBuf },

    #[error("Failed to load tokenizer from: {path}: {message}")]
    LoadTokenizer { path: PathBuf, message: String },

    #[error("Tokenizer has no `{token}` token")]
    MissingSpecialToken { token: &'static str },

    #[error("Tokenizer failed: {0}")]
    Tokenizer(String),

    #[error("Invalid model config at {path}: {message}")]
    ModelConfig { path: PathBuf, message: String },

    #[error("No safetensors weights found in {dir}")]
    NoWeights { dir: PathBuf },

    #[error("Invalid LoRA adapter: {message}")]
    Adapter { message: String },

    #[error("Invalid conversation: {0}")]
    InvalidConversation(String),

    #[error(
        "Context length exceeded: {prompt_tokens} prompt tokens + {max_tokens} max_tokens > {context_length}"
    )]
    ContextLengthExceeded {
        prompt_tokens: usize,
        max_tokens: usize,
        context_length: usize,
    },

    #[error("Invalid sampling parameters: {0}")]
    InvalidSampling(String),

    #[error("Inference queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Inference worker shut down unexpectedly")]
    WorkerShutdown,

    #[error("Failed to spawn inference worker thread")]
    SpawnWorkerFailed {
        #[source]
        source: std::io::Error,
    },

    #[error("Generation failed: {0}")]
    Generation(String),
}

impl From<tokenizers::Error> for EngineError {
    fn from(err: tokenizers::Error) -> Self {
        EngineError::Tokenizer(err.to_string())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
