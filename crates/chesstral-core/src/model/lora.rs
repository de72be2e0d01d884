use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// Prefix PEFT adds in front of every adapter tensor name.
const PEFT_PREFIX: &str = "base_model.model.";
const LORA_A: &str = ".lora_A.weight";
const LORA_B: &str = ".lora_B.weight";

/// One low-rank update `ΔW = B · A`.
#[derive(Debug, Clone)]
struct LoraPair {
    /// `(rank, in_features)`
    a: Tensor,
    /// `(out_features, rank)`
    b: Tensor,
}

/// A LoRA adapter, keyed by the base weight each pair updates.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    pairs: HashMap<String, LoraPair>,
    scaling: f64,
}

impl LoraAdapter {
    /// Read `lora.safetensors` (or any adapter file) from disk.
    pub fn load(path: &Path, scaling: f64) -> Result<Self> {
        if !path.is_file() {
            return Err(EngineError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let adapter = Self::from_tensors(tensors, scaling)?;
        info!(
            path = %path.display(),
            pairs = adapter.len(),
            scaling,
            "adapter loaded"
        );
        Ok(adapter)
    }

    /// Pair up `<base>.lora_A.weight` / `<base>.lora_B.weight` tensors.
    pub fn from_tensors(tensors: HashMap<String, Tensor>, scaling: f64) -> Result<Self> {
        if !scaling.is_finite() {
            return Err(EngineError::Adapter {
                message: format!("scaling must be finite, got {scaling}"),
            });
        }

        let mut a_parts = HashMap::new();
        let mut b_parts = HashMap::new();
        for (name, tensor) in tensors {
            let name = name.strip_prefix(PEFT_PREFIX).unwrap_or(&name);
            if let Some(base) = name.strip_suffix(LORA_A) {
                a_parts.insert(base.to_owned(), tensor);
            } else if let Some(base) = name.strip_suffix(LORA_B) {
                b_parts.insert(base.to_owned(), tensor);
            } else {
                return Err(EngineError::Adapter {
                    message: format!("unexpected tensor `{name}`"),
                });
            }
        }

        let mut pairs = HashMap::with_capacity(a_parts.len());
        for (base, a) in a_parts {
            let b = b_parts.remove(&base).ok_or_else(|| EngineError::Adapter {
                message: format!("`{base}` has lora_A but no lora_B"),
            })?;
            pairs.insert(format!("{base}.weight"), LoraPair { a, b });
        }
        if let Some(base) = b_parts.keys().next() {
            return Err(EngineError::Adapter {
                message: format!("`{base}` has lora_B but no lora_A"),
            });
        }
        if pairs.is_empty() {
            return Err(EngineError::Adapter {
                message: "adapter contains no LoRA weights".into(),
            });
        }

        Ok(Self { pairs, scaling })
    }

    /// Number of adapted weights.
    pub(crate) fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Replace each targeted weight `W` with `W + scaling · B · A`.
    ///
    /// Every pair must name an existing base weight of matching shape.
    /// The sum is computed in f32 and cast back to the base weight's dtype.
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<usize> {
        for (name, pair) in &self.pairs {
            let base = weights.get(name).ok_or_else(|| EngineError::Adapter {
                message: format!("base model has no weight `{name}`"),
            })?;
            let merged = merge_pair(name, base, pair, self.scaling)?;
            debug!(weight = %name, "merged adapter");
            weights.insert(name.clone(), merged);
        }
        Ok(self.pairs.len())
    }
}

fn merge_pair(name: &str, base: &Tensor, pair: &LoraPair, scaling: f64) -> Result<Tensor> {
    let (out_features, in_features) = base.dims2()?;
    let (rank_a, a_in) = pair.a.dims2()?;
    let (b_out, rank_b) = pair.b.dims2()?;
    if rank_a != rank_b || a_in != in_features || b_out != out_features {
        return Err(EngineError::Adapter {
            message: format!(
                "shape mismatch for `{name}`: base {out_features}x{in_features}, \
                 A {rank_a}x{a_in}, B {b_out}x{rank_b}"
            ),
        });
    }

    let dtype = base.dtype();
    let delta = pair
        .b
        .to_dtype(DType::F32)?
        .matmul(&pair.a.to_dtype(DType::F32)?)?
        .affine(scaling, 0.0)?;
    Ok((base.to_dtype(DType::F32)? + delta)?.to_dtype(dtype)?)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use tracing_test::traced_test;

    use super::*;

    fn tensor(rows: &[&[f32]]) -> Tensor {
        let cols = rows[0].len();
        Tensor::from_vec(rows.concat(), (rows.len(), cols), &Device::Cpu).unwrap()
    }

    fn adapter_tensors(prefix: &str) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::new();
        // A: (r=1, in=2), B: (out=2, r=1) => B·A = [[1, 2], [2, 4]]
        tensors.insert(format!("{prefix}layers.0.attention.wv.lora_A.weight"), tensor(&[&[1., 2.]]));
        tensors.insert(format!("{prefix}layers.0.attention.wv.lora_B.weight"), tensor(&[&[1.], &[2.]]));
        tensors
    }

    #[test]
    #[traced_test]
    fn merge_adds_scaled_low_rank_update() {
        let adapter = LoraAdapter::from_tensors(adapter_tensors(""), 2.0).unwrap();
        let mut weights = HashMap::new();
        weights.insert(
            "layers.0.attention.wv.weight".to_owned(),
            tensor(&[&[1., 0.], &[0., 1.]]),
        );
        weights.insert("norm.weight".to_owned(), tensor(&[&[5., 5.]]));

        assert_eq!(adapter.merge_into(&mut weights).unwrap(), 1);
        let merged = weights["layers.0.attention.wv.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(merged, vec![vec![3., 4.], vec![4., 9.]]);
        // Untargeted weights are left alone.
        assert_eq!(weights["norm.weight"].to_vec2::<f32>().unwrap(), vec![vec![5., 5.]]);
        assert!(logs_contain("merged adapter"));
    }

    #[test]
    fn peft_prefix_is_stripped() {
        let adapter = LoraAdapter::from_tensors(adapter_tensors(PEFT_PREFIX), 1.0).unwrap();
        assert_eq!(adapter.len(), 1);
        assert!(adapter.pairs.contains_key("layers.0.attention.wv.weight"));
    }

    #[test]
    fn unpaired_tensor_is_rejected() {
        let mut tensors = adapter_tensors("");
        tensors.remove("layers.0.attention.wv.lora_B.weight");
        let err = LoraAdapter::from_tensors(tensors, 1.0).unwrap_err();
        assert!(matches!(err, EngineError::Adapter { .. }));
    }

    #[test]
    fn missing_base_weight_is_rejected() {
        let adapter = LoraAdapter::from_tensors(adapter_tensors(""), 1.0).unwrap();
        let mut weights = HashMap::new();
        assert!(adapter.merge_into(&mut weights).is_err());
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let adapter = LoraAdapter::from_tensors(adapter_tensors(""), 1.0).unwrap();
        let mut weights = HashMap::new();
        weights.insert(
            "layers.0.attention.wv.weight".to_owned(),
            tensor(&[&[1., 0., 0.], &[0., 1., 0.]]),
        );
        assert!(adapter.merge_into(&mut weights).is_err());
    }

    #[test]
    fn empty_adapter_is_rejected() {
        assert!(LoraAdapter::from_tensors(HashMap::new(), 1.0).is_err());
    }
}
