use candle_core::{DType, Device, Tensor};
use candle_transformers::models::mistral::Model;
use tracing::info;

use super::checkpoint::Checkpoint;
use super::lora::LoraAdapter;
use super::{LoadOptions, ModelPaths};
use crate::error::Result;
use crate::generator::TextGenerator;

/// The candle Mistral model with its KV cache.
pub struct MistralGenerator {
    model: Model,
    device: Device,
    context_length: usize,
}

impl std::fmt::Debug for MistralGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MistralGenerator")
            .field("device", &self.device)
            .field("context_length", &self.context_length)
            .finish_non_exhaustive()
    }
}

impl MistralGenerator {
    /// Read the base checkpoint, merge the adapter (if any) and build the model.
    pub fn load(paths: &ModelPaths, options: &LoadOptions) -> Result<Self> {
        let device = options.device.device()?;
        let dtype = DType::from(options.dtype);
        info!(
            model_dir = %paths.model_dir.display(),
            device = %options.device,
            dtype = %options.dtype,
            "loading base model"
        );

        let mut checkpoint = Checkpoint::load(&paths.model_dir)?;
        match &paths.adapter {
            Some(path) => {
                let adapter = LoraAdapter::load(path, options.adapter_scaling)?;
                let merged = checkpoint.apply_adapter(&adapter)?;
                info!(adapter = %path.display(), merged, "adapter merged into base weights");
            }
            None => info!("no adapter configured, serving the base model"),
        }

        let model_context = checkpoint.context_length();
        let context_length = options
            .max_context
            .map_or(model_context, |cap| cap.min(model_context));

        let (config, vb) = checkpoint.into_parts(dtype, &device)?;
        let model = Model::new(&config, vb)?;
        info!(context_length, "model ready");

        Ok(Self {
            model,
            device,
            context_length,
        })
    }
}

impl TextGenerator for MistralGenerator {
    fn reset(&mut self) {
        self.model.clear_kv_cache();
    }

    fn forward(&mut self, tokens: &[u32], offset: usize) -> Result<Vec<f32>> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, offset)?;
        Ok(logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?.to_vec1()?)
    }

    fn context_length(&self) -> usize {
        self.context_length
    }
}
