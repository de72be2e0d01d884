//! Token sampling on top of candle's [`LogitsProcessor`].
//!
//! Before a token is drawn the raw logits are adjusted in place:
//! 1. `logit_bias` entries are added to their token ids;
//! 2. OpenAI-style penalties are subtracted for every token already
//!    generated: `count * frequency_penalty + presence_penalty`.
//!
//! A temperature of zero selects greedy (arg-max) decoding.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};

use crate::error::{EngineError, Result};

/// Temperatures at or below this are treated as greedy decoding.
const GREEDY_TEMPERATURE: f64 = 1e-7;

/// Generation parameters forwarded from a completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Upper bound on generated tokens (end-of-sequence not counted).
    pub max_tokens: usize,
    pub temperature: f64,
    /// Nucleus-sampling threshold in `(0, 1]`; `1.0` disables it.
    pub top_p: f64,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    /// Additive bias per token id.
    pub logit_bias: Vec<(u32, f32)>,
    /// Fixed seed; when `None` a time-derived seed is used.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 64,
            temperature: 0.7,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            logit_bias: Vec::new(),
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding with the given token budget.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(EngineError::InvalidSampling(
                "max_tokens must be at least 1".into(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(EngineError::InvalidSampling(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::InvalidSampling(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        for (name, value) in [
            ("presence_penalty", self.presence_penalty),
            ("frequency_penalty", self.frequency_penalty),
        ] {
            if !(-2.0..=2.0).contains(&value) {
                return Err(EngineError::InvalidSampling(format!(
                    "{name} must be in [-2, 2], got {value}"
                )));
            }
        }
        Ok(())
    }

    fn sampling(&self) -> Sampling {
        if self.temperature <= GREEDY_TEMPERATURE {
            Sampling::ArgMax
        } else if self.top_p < 1.0 {
            Sampling::TopP {
                p: self.top_p,
                temperature: self.temperature,
            }
        } else {
            Sampling::All {
                temperature: self.temperature,
            }
        }
    }
}

/// Per-generation sampler state.
pub struct Sampler {
    processor: LogitsProcessor,
    logit_bias: Vec<(u32, f32)>,
    presence_penalty: f32,
    frequency_penalty: f32,
    /// Occurrences of each generated token, for the penalties.
    counts: HashMap<u32, usize>,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("logit_bias", &self.logit_bias)
            .field("presence_penalty", &self.presence_penalty)
            .field("frequency_penalty", &self.frequency_penalty)
            .finish_non_exhaustive()
    }
}

impl Sampler {
    pub fn new(params: &SamplingParams) -> Self {
        let seed = params.seed.unwrap_or_else(time_seed);
        Self {
            processor: LogitsProcessor::from_sampling(seed, params.sampling()),
            logit_bias: params.logit_bias.clone(),
            presence_penalty: params.presence_penalty,
            frequency_penalty: params.frequency_penalty,
            counts: HashMap::new(),
        }
    }

    /// Adjust `logits` in place and draw the next token id.
    pub fn sample(&mut self, logits: &mut [f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(EngineError::Generation("model returned empty logits".into()));
        }
        for &(token, bias) in &self.logit_bias {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit += bias;
            }
        }
        if self.presence_penalty != 0.0 || self.frequency_penalty != 0.0 {
            for (&token, &count) in &self.counts {
                if let Some(logit) = logits.get_mut(token as usize) {
                    *logit -= count as f32 * self.frequency_penalty + self.presence_penalty;
                }
            }
        }
        let tensor = Tensor::from_slice(logits, logits.len(), &Device::Cpu)?;
        Ok(self.processor.sample(&tensor)?)
    }

    /// Record a token that became part of the output.
    pub fn accept(&mut self, token: u32) {
        *self.counts.entry(token).or_insert(0) += 1;
    }
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(299_792_458)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
