//! Server configuration, loaded from environment variables at startup and
//! optionally overridden from the command line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chesstral_core::{DeviceSpec, LoadOptions, ModelDType, ModelPaths};
use chesstral_core::model::DEFAULT_ADAPTER_SCALING;
use clap::Parser;

/// Name reported in responses when the request does not pick one.
pub const DEFAULT_MODEL_NAME: &str = "mistral-finetune";

/// Runtime configuration for chesstral-server.
///
/// Everything except the model directory has a default.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// Directory with `params.json`/`config.json` and `*.safetensors`.
    pub model_dir: Option<PathBuf>,

    /// `tokenizer.json`; defaults to `<model_dir>/tokenizer.json`.
    pub tokenizer_path: Option<PathBuf>,

    /// LoRA adapter merged into the base weights at load time.
    pub adapter_path: Option<PathBuf>,

    pub adapter_scaling: f64,

    /// Model id reported by `/v1/models` and `/health`.
    pub model_name: String,

    /// `cpu`, `cuda` or `cuda:N`.
    pub device: String,

    /// `f32`, `f16` or `bf16`.
    pub dtype: String,

    /// Optional cap on the context window.
    pub max_context: Option<usize>,

    /// Generations that may wait behind the running one.
    pub queue_capacity: usize,

    /// `None` disables the per-request deadline.
    pub request_timeout: Option<Duration>,

    /// Upper bound accepted for `max_tokens`.
    pub max_tokens_limit: usize,

    /// Comma-separated list of allowed CORS origins; `None` allows any.
    pub cors_allowed_origins: Option<String>,

    /// Serve `/api-docs/openapi.json`.
    pub enable_openapi: bool,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

/// Command-line overrides; each flag wins over its environment variable.
#[derive(Debug, Default, Parser)]
#[command(name = "chesstral-server", version, about = "Local Mistral + LoRA chat-completion server")]
pub struct Cli {
    /// Address to listen on.
    #[arg(long)]
    pub bind: Option<String>,

    /// Base model directory.
    #[arg(long)]
    pub model_dir: Option<PathBuf>,

    /// Path to tokenizer.json.
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// LoRA adapter safetensors file.
    #[arg(long)]
    pub adapter: Option<PathBuf>,

    /// Compute device (cpu, cuda, cuda:N).
    #[arg(long)]
    pub device: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let timeout_secs: u64 = parse_env(&lookup, "CHESSTRAL_REQUEST_TIMEOUT_SECS", 300);
        Self {
            bind_address: env_or(&lookup, "CHESSTRAL_BIND", "0.0.0.0:8000"),
            model_dir: path_env(&lookup, "CHESSTRAL_MODEL_DIR"),
            tokenizer_path: path_env(&lookup, "CHESSTRAL_TOKENIZER"),
            adapter_path: path_env(&lookup, "CHESSTRAL_ADAPTER"),
            adapter_scaling: parse_env(&lookup, "CHESSTRAL_ADAPTER_SCALING", DEFAULT_ADAPTER_SCALING),
            model_name: env_or(&lookup, "CHESSTRAL_MODEL_NAME", DEFAULT_MODEL_NAME),
            device: env_or(&lookup, "CHESSTRAL_DEVICE", default_device()),
            dtype: env_or(&lookup, "CHESSTRAL_DTYPE", "f32"),
            max_context: lookup("CHESSTRAL_MAX_CONTEXT").and_then(|v| v.parse().ok()),
            queue_capacity: parse_env(&lookup, "CHESSTRAL_QUEUE_CAPACITY", 16),
            request_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            max_tokens_limit: parse_env(&lookup, "CHESSTRAL_MAX_TOKENS_LIMIT", 4096),
            cors_allowed_origins: lookup("CHESSTRAL_CORS_ORIGINS").filter(|v| !v.trim().is_empty()),
            enable_openapi: bool_env(&lookup, "CHESSTRAL_ENABLE_OPENAPI", true),
            log_level: env_or(&lookup, "CHESSTRAL_LOG", "info"),
            log_json: bool_env(&lookup, "CHESSTRAL_LOG_JSON", false),
        }
    }

    /// Apply command-line overrides.
    pub fn merge_cli(mut self, cli: Cli) -> Self {
        if let Some(bind) = cli.bind {
            self.bind_address = bind;
        }
        if cli.model_dir.is_some() {
            self.model_dir = cli.model_dir;
        }
        if cli.tokenizer.is_some() {
            self.tokenizer_path = cli.tokenizer;
        }
        if cli.adapter.is_some() {
            self.adapter_path = cli.adapter;
        }
        if let Some(device) = cli.device {
            self.device = device;
        }
        self
    }

    /// Resolve the files the engine loads.
    pub fn model_paths(&self) -> anyhow::Result<ModelPaths> {
        let model_dir = self.model_dir.clone().ok_or_else(|| {
            anyhow!("no model directory configured: set CHESSTRAL_MODEL_DIR or pass --model-dir")
        })?;
        let tokenizer = self
            .tokenizer_path
            .clone()
            .unwrap_or_else(|| model_dir.join("tokenizer.json"));
        Ok(ModelPaths {
            model_dir,
            tokenizer,
            adapter: self.adapter_path.clone(),
        })
    }

    pub fn load_options(&self) -> anyhow::Result<LoadOptions> {
        let device: DeviceSpec = self.device.parse().map_err(|e: String| anyhow!(e))?;
        let dtype: ModelDType = self
            .dtype
            .parse()
            .with_context(|| format!("invalid CHESSTRAL_DTYPE `{}` (expected f32, f16 or bf16)", self.dtype))?;
        Ok(LoadOptions {
            device,
            dtype,
            adapter_scaling: self.adapter_scaling,
            max_context: self.max_context,
        })
    }
}

fn default_device() -> &'static str {
    if cfg!(feature = "cuda") { "cuda" } else { "cpu" }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn bool_env(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn path_env(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
