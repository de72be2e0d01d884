//! Test doubles: a tiny word-level tokenizer and a scripted generator.
//!
//! Compiled for this crate's tests and, behind the `testing` feature, for
//! downstream crates that need a [`ChatEngine`](crate::engine::ChatEngine)
//! without real model weights.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokenizers::Tokenizer;

use crate::error::Result;
use crate::generator::TextGenerator;
use crate::template::{BOS_TOKEN, EOS_TOKEN, INST_END_TOKEN, INST_TOKEN, PromptEncoder};

const SPECIAL: [&str; 5] = ["<unk>", BOS_TOKEN, EOS_TOKEN, INST_TOKEN, INST_END_TOKEN];

/// Words known to [`tiny_tokenizer`], after the special tokens.
pub const WORDS: &[&str] = &[
    "hello", "world", "you", "are", "a", "chess", "bot", "the", "is", "good", "move", "e4",
    "e5", "Nf3", "Nc6", "play", "I", "fine", "how", "?", "!", ",", ".",
];

/// Build a whitespace/word-level tokenizer over `vocab` (ids follow order).
///
/// Entries that are Mistral control tokens are registered as special tokens.
pub fn tokenizer_from_vocab(vocab: &[&str]) -> Tokenizer {
    let ids: serde_json::Map<String, Value> = vocab
        .iter()
        .enumerate()
        .map(|(id, word)| ((*word).to_owned(), json!(id)))
        .collect();
    let added: Vec<Value> = vocab
        .iter()
        .enumerate()
        .filter(|(_, word)| SPECIAL.contains(word))
        .map(|(id, word)| {
            json!({
                "id": id,
                "content": word,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true,
            })
        })
        .collect();
    let definition = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": ids, "unk_token": "<unk>" },
    });
    Tokenizer::from_bytes(definition.to_string().as_bytes())
        .expect("tiny tokenizer definition is valid")
}

/// Tokenizer with the Mistral control tokens plus [`WORDS`].
pub fn tiny_tokenizer() -> Tokenizer {
    let vocab: Vec<&str> = SPECIAL.iter().chain(WORDS).copied().collect();
    tokenizer_from_vocab(&vocab)
}

/// A [`PromptEncoder`] over [`tiny_tokenizer`].
pub fn tiny_encoder() -> PromptEncoder {
    PromptEncoder::new(Arc::new(tiny_tokenizer())).expect("control tokens present")
}

/// A generator that deterministically emits a fixed token script, then EOS.
///
/// Logits put all mass on the next scripted token, so greedy and sampled
/// decoding agree.
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    vocab_size: usize,
    script: Vec<u32>,
    eos: u32,
    step: usize,
    context_length: usize,
    delay: Duration,
    calls: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl ScriptedGenerator {
    pub fn new(encoder: &PromptEncoder, script: Vec<u32>) -> Self {
        Self {
            vocab_size: encoder.tokenizer().get_vocab_size(true),
            script,
            eos: encoder.special_tokens().eos,
            step: 0,
            context_length: 4096,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Emit the tokens of `text` (encoded with `encoder`).
    pub fn replying(encoder: &PromptEncoder, text: &str) -> Self {
        let script = encoder.encode_text(text).expect("encodable reply");
        Self::new(encoder, script)
    }

    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    /// Sleep this long in every forward call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Shared log of `(tokens.len(), offset)` for each forward call.
    pub fn calls(&self) -> Arc<Mutex<Vec<(usize, usize)>>> {
        Arc::clone(&self.calls)
    }
}

impl TextGenerator for ScriptedGenerator {
    fn reset(&mut self) {
        self.step = 0;
    }

    fn forward(&mut self, tokens: &[u32], offset: usize) -> Result<Vec<f32>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((tokens.len(), offset));
        }
        let next = self.script.get(self.step).copied().unwrap_or(self.eos);
        self.step += 1;

        let mut logits = vec![-10.0_f32; self.vocab_size];
        if let Some(logit) = logits.get_mut(next as usize) {
            *logit = 10.0;
        }
        Ok(logits)
    }

    fn context_length(&self) -> usize {
        self.context_length
    }
}
