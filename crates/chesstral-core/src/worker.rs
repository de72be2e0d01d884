use serde::Serialize;
use strum::Display;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::generator::TextGenerator;
use crate::sampling::{Sampler, SamplingParams};
use crate::template::PromptEncoder;

// ── Channel protocol ──────────────────────────────────────────────────────────

/// Commands accepted by the inference worker.
pub(crate) enum WorkerCommand {
    Generate {
        prompt: Vec<u32>,
        params: SamplingParams,
        events_tx: mpsc::Sender<GenerationEvent>,
    },
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FinishReason {
    /// The model produced the end-of-sequence token.
    Stop,
    /// The `max_tokens` budget was used up.
    Length,
}

/// Output of a running generation, in order.
///
/// A stream yields zero or more [`GenerationEvent::Delta`]s and ends with
/// exactly one [`GenerationEvent::Done`] or [`GenerationEvent::Error`].
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Newly decoded text.
    Delta(String),
    Done {
        /// Full decoded reply.
        text: String,
        finish_reason: FinishReason,
        completion_tokens: usize,
    },
    Error(String),
}

// ── Incremental detokenisation ────────────────────────────────────────────────

/// Turns a growing token sequence into text deltas.
///
/// The whole sequence is re-decoded at each step so tokenizers that merge
/// byte-level pieces produce correct text; output is held back while it ends
/// in an incomplete UTF-8 sequence.
#[derive(Debug, Default)]
struct IncrementalDecoder {
    emitted: usize,
}

impl IncrementalDecoder {
    fn step(&mut self, encoder: &PromptEncoder, tokens: &[u32]) -> Result<Option<String>> {
        let text = encoder.decode(tokens)?;
        if text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        Ok(self.take_new(&text))
    }

    fn finish(&mut self, text: &str) -> Option<String> {
        self.take_new(text)
    }

    fn take_new(&mut self, text: &str) -> Option<String> {
        let delta = text.get(self.emitted..).filter(|d| !d.is_empty())?;
        self.emitted = text.len();
        Some(delta.to_owned())
    }
}

// ── Inference worker ──────────────────────────────────────────────────────────

/// Owns the model and runs one generation at a time.
///
/// The worker lives on its own OS thread; the model is never touched from
/// anywhere else, so no locking is needed around the forward pass.
pub(crate) struct InferenceWorker<G> {
    generator: G,
    encoder: PromptEncoder,
    eos_token: u32,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
}

impl<G: TextGenerator> InferenceWorker<G> {
    pub(crate) fn new(
        generator: G,
        encoder: PromptEncoder,
        cmd_rx: mpsc::Receiver<WorkerCommand>,
    ) -> Self {
        let eos_token = encoder.special_tokens().eos;
        Self {
            generator,
            encoder,
            eos_token,
            cmd_rx,
        }
    }

    /// Main loop: block on the queue until every sender is dropped.
    pub(crate) fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.blocking_recv() {
            self.handle_command(cmd);
        }
        debug!("inference worker exiting: all engine handles dropped");
    }

    fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Generate {
                prompt,
                params,
                events_tx,
            } => {
                if events_tx.is_closed() {
                    debug!("skipping generation: caller went away while queued");
                    return;
                }
                match self.generate(&prompt, &params, &events_tx) {
                    Ok(Some(done)) => {
                        let _ = events_tx.blocking_send(done);
                    }
                    Ok(None) => debug!("generation abandoned: receiver dropped"),
                    Err(e) => {
                        warn!(error = %e, "generation failed");
                        let _ = events_tx.blocking_send(GenerationEvent::Error(e.to_string()));
                    }
                }
            }
        }
    }

    /// Run prefill and the sampling loop.
    ///
    /// Returns `Ok(None)` when the caller dropped its receiver mid-way.
    fn generate(
        &mut self,
        prompt: &[u32],
        params: &SamplingParams,
        events_tx: &mpsc::Sender<GenerationEvent>,
    ) -> Result<Option<GenerationEvent>> {
        if prompt.is_empty() {
            return Err(EngineError::Generation("empty prompt".into()));
        }

        self.generator.reset();
        let mut sampler = Sampler::new(params);
        let mut decoder = IncrementalDecoder::default();
        let mut generated: Vec<u32> = Vec::with_capacity(params.max_tokens);
        let mut finish_reason = FinishReason::Length;

        let mut logits = self.generator.forward(prompt, 0)?;
        loop {
            let token = sampler.sample(&mut logits)?;
            if token == self.eos_token {
                finish_reason = FinishReason::Stop;
                break;
            }
            sampler.accept(token);
            generated.push(token);

            if let Some(delta) = decoder.step(&self.encoder, &generated)? {
                if events_tx.blocking_send(GenerationEvent::Delta(delta)).is_err() {
                    return Ok(None);
                }
            }
            if generated.len() >= params.max_tokens {
                break;
            }
            if events_tx.is_closed() {
                return Ok(None);
            }
            let position = prompt.len() + generated.len() - 1;
            logits = self.generator.forward(&[token], position)?;
        }

        let text = self.encoder.decode(&generated)?;
        if let Some(tail) = decoder.finish(&text) {
            if events_tx.blocking_send(GenerationEvent::Delta(tail)).is_err() {
                return Ok(None);
            }
        }

        debug!(
            prompt_tokens = prompt.len(),
            completion_tokens = generated.len(),
            %finish_reason,
            "generation finished"
        );
        Ok(Some(GenerationEvent::Done {
            text,
            finish_reason,
            completion_tokens: generated.len(),
        }))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{ScriptedGenerator, tiny_tokenizer};

    fn encoder() -> PromptEncoder {
        PromptEncoder::new(Arc::new(tiny_tokenizer())).unwrap()
    }

    fn spawn(generator: ScriptedGenerator) -> mpsc::Sender<WorkerCommand> {
        let (tx, rx) = mpsc::channel(4);
        let worker = InferenceWorker::new(generator, encoder(), rx);
        std::thread::spawn(move || worker.run());
        tx
    }

    async fn collect(
        tx: &mpsc::Sender<WorkerCommand>,
        prompt: Vec<u32>,
        params: SamplingParams,
    ) -> Vec<GenerationEvent> {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        tx.send(WorkerCommand::Generate {
            prompt,
            params,
            events_tx,
        })
        .await
        .unwrap();
        let mut events = Vec::new();
        while let Some(event) = events_rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn stops_at_end_of_sequence() {
        let enc = encoder();
        let script = enc.encode_text("good move").unwrap();
        let tx = spawn(ScriptedGenerator::new(&enc, script));

        let events = collect(&tx, vec![1, 3, 4], SamplingParams::greedy(16)).await;
        assert_eq!(
            events.last().unwrap(),
            &GenerationEvent::Done {
                text: "good move".into(),
                finish_reason: FinishReason::Stop,
                completion_tokens: 2,
            }
        );
        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "good move");
    }

    #[tokio::test]
    async fn respects_max_tokens() {
        let enc = encoder();
        let script = enc.encode_text("the bot is good").unwrap();
        let tx = spawn(ScriptedGenerator::new(&enc, script));

        let events = collect(&tx, vec![1, 3, 4], SamplingParams::greedy(2)).await;
        match events.last().unwrap() {
            GenerationEvent::Done {
                text,
                finish_reason,
                completion_tokens,
            } => {
                assert_eq!(text, "the bot");
                assert_eq!(*finish_reason, FinishReason::Length);
                assert_eq!(*completion_tokens, 2);
            }
            other => panic!("unexpected final event {other:?}"),
        }
    }

    #[tokio::test]
    async fn feeds_positions_after_the_prompt() {
        let enc = encoder();
        let script = enc.encode_text("good move").unwrap();
        let generator = ScriptedGenerator::new(&enc, script);
        let calls = generator.calls();
        let tx = spawn(generator);

        collect(&tx, vec![1, 3, 7, 4], SamplingParams::greedy(16)).await;
        let calls = calls.lock().unwrap().clone();
        // Prefill at 0, then one call per generated token.
        assert_eq!(calls, vec![(4, 0), (1, 4), (1, 5)]);
    }

    #[tokio::test]
    async fn empty_prompt_reports_error() {
        let enc = encoder();
        let tx = spawn(ScriptedGenerator::new(&enc, Vec::new()));
        let events = collect(&tx, Vec::new(), SamplingParams::greedy(4)).await;
        assert!(matches!(events.as_slice(), [GenerationEvent::Error(_)]));
    }

    #[test]
    fn incremental_decoder_emits_only_new_text() {
        let mut decoder = IncrementalDecoder::default();
        assert_eq!(decoder.take_new("good"), Some("good".into()));
        assert_eq!(decoder.take_new("good move"), Some(" move".into()));
        assert_eq!(decoder.take_new("good move"), None);
    }
}
