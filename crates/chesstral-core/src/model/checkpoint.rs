//! Reading a Mistral checkpoint directory.
//!
//! Two layouts are understood:
//!
//! | Layout        | Config        | Tensor names                         |
//! |---------------|---------------|--------------------------------------|
//! | native        | `params.json` | `layers.0.attention.wq.weight`, …    |
//! | Hugging Face  | `config.json` | `model.layers.0.self_attn.q_proj.weight`, … |
//!
//! The candle Mistral model expects the Hugging Face layout, so native
//! checkpoints are renamed and their query/key projections permuted from the
//! interleaved rotary ordering to the half-split one. Adapters are merged
//! **before** that conversion, while names still match the adapter's.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::mistral;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::lora::LoraAdapter;
use crate::error::{EngineError, Result};

const NATIVE_CONFIG: &str = "params.json";
const HF_CONFIG: &str = "config.json";
/// Used when a native `params.json` does not say.
const DEFAULT_CONTEXT_LENGTH: usize = 32_768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Native,
    HuggingFace,
}

impl CheckpointFormat {
    pub fn detect(dir: &Path) -> Result<Self> {
        if dir.join(NATIVE_CONFIG).is_file() {
            Ok(CheckpointFormat::Native)
        } else if dir.join(HF_CONFIG).is_file() {
            Ok(CheckpointFormat::HuggingFace)
        } else {
            Err(EngineError::MissingFile {
                path: dir.join(NATIVE_CONFIG),
            })
        }
    }
}

/// `params.json` as written by mistral-finetune / mistral-inference.
#[derive(Debug, Clone, Deserialize)]
struct NativeParams {
    dim: usize,
    n_layers: usize,
    hidden_dim: usize,
    n_heads: usize,
    n_kv_heads: Option<usize>,
    head_dim: Option<usize>,
    norm_eps: f64,
    vocab_size: usize,
    rope_theta: Option<f64>,
    sliding_window: Option<usize>,
    max_seq_len: Option<usize>,
}

/// Attention geometry needed for the rotary permutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadLayout {
    n_heads: usize,
    n_kv_heads: usize,
}

/// A loaded checkpoint: model config plus raw (CPU) weights.
#[derive(Debug)]
pub struct Checkpoint {
    format: CheckpointFormat,
    config: Value,
    context_length: usize,
    heads: HeadLayout,
    weights: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Read config and every `*.safetensors` file from `dir` into CPU memory.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(EngineError::MissingFile {
                path: dir.to_path_buf(),
            });
        }
        let format = CheckpointFormat::detect(dir)?;
        let (config, heads) = match format {
            CheckpointFormat::Native => read_native_config(&dir.join(NATIVE_CONFIG))?,
            CheckpointFormat::HuggingFace => read_hf_config(&dir.join(HF_CONFIG))?,
        };
        let context_length = config
            .get("max_position_embeddings")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);

        let mut weights = HashMap::new();
        for file in weight_files(dir)? {
            debug!(file = %file.display(), "reading weights");
            weights.extend(candle_core::safetensors::load(&file, &Device::Cpu)?);
        }
        info!(
            dir = %dir.display(),
            ?format,
            tensors = weights.len(),
            context_length,
            "checkpoint loaded"
        );

        Ok(Self {
            format,
            config,
            context_length,
            heads,
            weights,
        })
    }

    /// Build a checkpoint from in-memory parts (native layout).
    #[cfg(test)]
    fn native_from_parts(n_heads: usize, n_kv_heads: usize, weights: HashMap<String, Tensor>) -> Self {
        Self {
            format: CheckpointFormat::Native,
            config: json!({}),
            context_length: DEFAULT_CONTEXT_LENGTH,
            heads: HeadLayout {
                n_heads,
                n_kv_heads,
            },
            weights,
        }
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    /// Merge `adapter` into the base weights; returns the number of tensors touched.
    pub fn apply_adapter(&mut self, adapter: &LoraAdapter) -> Result<usize> {
        adapter.merge_into(&mut self.weights)
    }

    /// Convert to the candle Mistral config and a var-builder over the weights.
    pub fn into_parts(
        self,
        dtype: DType,
        device: &Device,
    ) -> Result<(mistral::Config, VarBuilder<'static>)> {
        let config: mistral::Config =
            serde_json::from_value(self.config).map_err(|e| EngineError::ModelConfig {
                path: PathBuf::from(HF_CONFIG),
                message: e.to_string(),
            })?;

        let weights = match self.format {
            CheckpointFormat::HuggingFace => self.weights,
            CheckpointFormat::Native => convert_native(self.weights, self.heads)?,
        };
        Ok((config, VarBuilder::from_tensors(weights, dtype, device)))
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| EngineError::ModelConfig {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Translate `params.json` into the Hugging Face config keys candle reads.
fn read_native_config(path: &Path) -> Result<(Value, HeadLayout)> {
    let params: NativeParams =
        serde_json::from_value(read_json(path)?).map_err(|e| EngineError::ModelConfig {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    let n_kv_heads = params.n_kv_heads.unwrap_or(params.n_heads);
    let config = json!({
        "vocab_size": params.vocab_size,
        "hidden_size": params.dim,
        "intermediate_size": params.hidden_dim,
        "num_hidden_layers": params.n_layers,
        "num_attention_heads": params.n_heads,
        "num_key_value_heads": n_kv_heads,
        "head_dim": params.head_dim,
        "hidden_act": "silu",
        "max_position_embeddings": params.max_seq_len.unwrap_or(DEFAULT_CONTEXT_LENGTH),
        "rms_norm_eps": params.norm_eps,
        "rope_theta": params.rope_theta.unwrap_or(10_000.0),
        "sliding_window": params.sliding_window,
        "use_flash_attn": false,
    });
    Ok((
        config,
        HeadLayout {
            n_heads: params.n_heads,
            n_kv_heads,
        },
    ))
}

fn read_hf_config(path: &Path) -> Result<(Value, HeadLayout)> {
    let mut config = read_json(path)?;
    let field = |name: &str| {
        config
            .get(name)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| EngineError::ModelConfig {
                path: path.to_path_buf(),
                message: format!("missing integer field `{name}`"),
            })
    };
    let n_heads = field("num_attention_heads")?;
    let n_kv_heads = field("num_key_value_heads").unwrap_or(n_heads);
    if let Some(object) = config.as_object_mut() {
        object
            .entry("use_flash_attn")
            .or_insert(Value::Bool(false));
    }
    Ok((
        config,
        HeadLayout {
            n_heads,
            n_kv_heads,
        },
    ))
}

/// Sorted `*.safetensors` files in `dir`, skipping adapter files.
fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_safetensors = path.extension().is_some_and(|e| e == "safetensors");
        let is_adapter = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("lora"));
        if is_safetensors && !is_adapter {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(EngineError::NoWeights {
            dir: dir.to_path_buf(),
        });
    }
    files.sort();
    Ok(files)
}

// ── Native → Hugging Face conversion ─────────────────────────────────────────

/// Map a native tensor name to its Hugging Face equivalent.
pub fn native_to_hf_name(name: &str) -> Option<String> {
    match name {
        "tok_embeddings.weight" => return Some("model.embed_tokens.weight".into()),
        "norm.weight" => return Some("model.norm.weight".into()),
        "output.weight" => return Some("lm_head.weight".into()),
        _ => {}
    }

    let rest = name.strip_prefix("layers.")?;
    let (layer, suffix) = rest.split_once('.')?;
    layer.parse::<usize>().ok()?;
    let mapped = match suffix {
        "attention.wq.weight" => "self_attn.q_proj.weight",
        "attention.wk.weight" => "self_attn.k_proj.weight",
        "attention.wv.weight" => "self_attn.v_proj.weight",
        "attention.wo.weight" => "self_attn.o_proj.weight",
        "feed_forward.w1.weight" => "mlp.gate_proj.weight",
        "feed_forward.w2.weight" => "mlp.down_proj.weight",
        "feed_forward.w3.weight" => "mlp.up_proj.weight",
        "attention_norm.weight" => "input_layernorm.weight",
        "ffn_norm.weight" => "post_attention_layernorm.weight",
        _ => return None,
    };
    Some(format!("model.layers.{layer}.{mapped}"))
}

/// Reorder the rows of a query/key projection from interleaved rotary pairs
/// to the half-split layout: `(h, d/2, 2, in) -> (h, 2, d/2, in)`.
pub fn permute_rotary(weight: &Tensor, n_heads: usize) -> Result<Tensor> {
    let (rows, cols) = weight.dims2()?;
    if n_heads == 0 || rows % (n_heads * 2) != 0 {
        return Err(EngineError::ModelConfig {
            path: PathBuf::from(NATIVE_CONFIG),
            message: format!("cannot split {rows} projection rows into {n_heads} rotary heads"),
        });
    }
    Ok(weight
        .reshape((n_heads, rows / n_heads / 2, 2, cols))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((rows, cols))?)
}

fn convert_native(
    weights: HashMap<String, Tensor>,
    heads: HeadLayout,
) -> Result<HashMap<String, Tensor>> {
    let mut converted = HashMap::with_capacity(weights.len());
    for (name, tensor) in weights {
        let Some(hf_name) = native_to_hf_name(&name) else {
            warn!(tensor = %name, "ignoring unrecognised tensor");
            continue;
        };
        let tensor = if name.ends_with("attention.wq.weight") {
            permute_rotary(&tensor, heads.n_heads)?
        } else if name.ends_with("attention.wk.weight") {
            permute_rotary(&tensor, heads.n_kv_heads)?
        } else {
            tensor
        };
        converted.insert(hf_name, tensor);
    }
    Ok(converted)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
