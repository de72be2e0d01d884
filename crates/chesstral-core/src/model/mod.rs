//! Loading the Mistral base model and merging the fine-tuning adapter.

mod checkpoint;
mod lora;
mod mistral;

use std::path::PathBuf;
use std::str::FromStr;

use candle_core::{DType, Device};
use strum::{Display, EnumString};

use crate::error::Result;

pub use checkpoint::{Checkpoint, CheckpointFormat, native_to_hf_name, permute_rotary};
pub use lora::LoraAdapter;
pub use mistral::MistralGenerator;

/// Default LoRA scaling used by mistral-finetune adapters.
pub const DEFAULT_ADAPTER_SCALING: f64 = 2.0;

/// Filesystem locations of everything the engine loads at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    /// Directory holding the config (`params.json` or `config.json`) and
    /// `*.safetensors` weights.
    pub model_dir: PathBuf,
    /// `tokenizer.json` in Hugging Face `tokenizers` format.
    pub tokenizer: PathBuf,
    /// Optional LoRA adapter weights.
    pub adapter: Option<PathBuf>,
}

/// Storage precision for the model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ModelDType {
    F32,
    F16,
    BF16,
}

impl From<ModelDType> for DType {
    fn from(dtype: ModelDType) -> Self {
        match dtype {
            ModelDType::F32 => DType::F32,
            ModelDType::F16 => DType::F16,
            ModelDType::BF16 => DType::BF16,
        }
    }
}

/// Where the forward pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
}

impl DeviceSpec {
    pub fn device(self) -> Result<Device> {
        Ok(match self {
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal)?,
        })
    }
}

impl FromStr for DeviceSpec {
    type Err = String;

    /// Accepts `cpu`, `cuda` and `cuda:<ordinal>`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse().ok())
                .map(DeviceSpec::Cuda)
                .ok_or_else(|| format!("unknown device `{s}` (expected cpu, cuda or cuda:N)")),
        }
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSpec::Cpu => f.write_str("cpu"),
            DeviceSpec::Cuda(n) => write!(f, "cuda:{n}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub device: DeviceSpec,
    pub dtype: ModelDType,
    pub adapter_scaling: f64,
    /// Caps the context window below the model's own limit.
    pub max_context: Option<usize>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            device: DeviceSpec::Cpu,
            dtype: ModelDType::F32,
            adapter_scaling: DEFAULT_ADAPTER_SCALING,
            max_context: None,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
