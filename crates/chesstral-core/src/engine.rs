//! Public handle to the inference worker.
//!
//! # Architecture
//!
//! ```text
//! HTTP handlers ──► ChatEngine (Clone) ──► bounded queue ──► [chesstral-worker]
//!                    encode + validate                        owns the model
//!                                                                  │
//!                    GenerationStream ◄──── events (Delta / Done / Error)
//! ```
//!
//! - Exactly one thread owns the [`TextGenerator`]; generations run one at a
//!   time in arrival order.
//! - Admission is non-blocking: a full queue yields [`EngineError::QueueFull`].
//! - Dropping a [`GenerationStream`] cancels the generation at the next token.
//! - The worker exits once every `ChatEngine` clone is dropped.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::chat::ChatMessage;
use crate::error::{EngineError, Result};
use crate::generator::TextGenerator;
use crate::model::{LoadOptions, MistralGenerator, ModelPaths};
use crate::sampling::SamplingParams;
use crate::template::PromptEncoder;
use crate::worker::{FinishReason, GenerationEvent, InferenceWorker, WorkerCommand};

/// Receives the events of one generation.
pub type GenerationStream = mpsc::Receiver<GenerationEvent>;

/// Capacity of the per-generation event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Generations allowed to wait behind the running one.
    pub queue_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { queue_capacity: 16 }
    }
}

/// A finished, non-streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Completion {
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Cloneable front-end for the single inference worker.
#[derive(Debug, Clone)]
pub struct ChatEngine {
    cmd_tx: mpsc::Sender<WorkerCommand>,
    encoder: PromptEncoder,
    context_length: usize,
    queue_capacity: usize,
}

impl ChatEngine {
    /// Start a worker thread that owns `generator`.
    pub fn start<G: TextGenerator>(
        generator: G,
        encoder: PromptEncoder,
        options: EngineOptions,
    ) -> Result<Self> {
        let queue_capacity = options.queue_capacity.max(1);
        let context_length = generator.context_length();
        let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCommand>(queue_capacity);

        let worker = InferenceWorker::new(generator, encoder.clone(), cmd_rx);
        std::thread::Builder::new()
            .name("chesstral-worker".into())
            .spawn(move || worker.run())
            .map_err(|source| EngineError::SpawnWorkerFailed { source })?;

        info!(queue_capacity, context_length, "inference worker started");
        Ok(Self {
            cmd_tx,
            encoder,
            context_length,
            queue_capacity,
        })
    }

    /// Load tokenizer, base model and adapter from disk, then start the worker.
    ///
    /// This is blocking and may take a long time for large checkpoints.
    pub fn load(paths: &ModelPaths, load: &LoadOptions, options: EngineOptions) -> Result<Self> {
        info!(tokenizer = %paths.tokenizer.display(), "loading tokenizer");
        let encoder = PromptEncoder::from_file(&paths.tokenizer)?;
        let generator = MistralGenerator::load(paths, load)?;
        Self::start(generator, encoder, options)
    }

    pub fn encoder(&self) -> &PromptEncoder {
        &self.encoder
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Encode `messages` and check that the reply fits in the context window.
    pub fn prepare(&self, messages: &[ChatMessage], params: &SamplingParams) -> Result<Vec<u32>> {
        params.validate()?;
        let prompt = self.encoder.encode(messages)?;
        if prompt.len() + params.max_tokens > self.context_length {
            return Err(EngineError::ContextLengthExceeded {
                prompt_tokens: prompt.len(),
                max_tokens: params.max_tokens,
                context_length: self.context_length,
            });
        }
        Ok(prompt)
    }

    /// Queue a generation for an already prepared prompt.
    pub fn generate_stream(
        &self,
        prompt: Vec<u32>,
        params: SamplingParams,
    ) -> Result<GenerationStream> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.cmd_tx
            .try_send(WorkerCommand::Generate {
                prompt,
                params,
                events_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EngineError::QueueFull {
                    capacity: self.queue_capacity,
                },
                mpsc::error::TrySendError::Closed(_) => EngineError::WorkerShutdown,
            })?;
        Ok(events_rx)
    }

    /// Encode, generate and collect a whole reply.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        params: SamplingParams,
    ) -> Result<Completion> {
        let prompt = self.prepare(messages, &params)?;
        let prompt_tokens = prompt.len();
        let stream = self.generate_stream(prompt, params)?;
        collect_completion(stream, prompt_tokens).await
    }
}

/// Drain `stream` into a [`Completion`], discarding the text deltas.
///
/// Dropping the returned future drops the stream, which cancels the
/// generation.
pub async fn collect_completion(
    mut stream: GenerationStream,
    prompt_tokens: usize,
) -> Result<Completion> {
    while let Some(event) = stream.recv().await {
        match event {
            GenerationEvent::Delta(_) => {}
            GenerationEvent::Done {
                text,
                finish_reason,
                completion_tokens,
            } => {
                debug!(prompt_tokens, completion_tokens, %finish_reason, "completion collected");
                return Ok(Completion {
                    text,
                    finish_reason,
                    prompt_tokens,
                    completion_tokens,
                });
            }
            GenerationEvent::Error(message) => return Err(EngineError::Generation(message)),
        }
    }
    Err(EngineError::WorkerShutdown)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::testing::{ScriptedGenerator, tiny_encoder};

    fn engine_replying(text: &str) -> ChatEngine {
        let encoder = tiny_encoder();
        let generator = ScriptedGenerator::replying(&encoder, text);
        ChatEngine::start(generator, encoder, EngineOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn completion_usage_adds_up() {
        let engine = engine_replying("e5 is good");
        let completion = engine
            .complete(&[ChatMessage::user("e4")], SamplingParams::greedy(16))
            .await
            .unwrap();

        assert_eq!(completion.text, "e5 is good");
        assert_eq!(completion.finish_reason, FinishReason::Stop);
        assert_eq!(completion.prompt_tokens, 4);
        assert_eq!(completion.completion_tokens, 3);
        assert_eq!(completion.total_tokens(), 7);
    }

    #[tokio::test]
    async fn context_overflow_is_rejected_before_queueing() {
        let encoder = tiny_encoder();
        let generator = ScriptedGenerator::replying(&encoder, "e5").with_context_length(8);
        let engine = ChatEngine::start(generator, encoder, EngineOptions::default()).unwrap();

        let err = engine
            .complete(&[ChatMessage::user("hello world")], SamplingParams::greedy(16))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ContextLengthExceeded {
                prompt_tokens: 5,
                max_tokens: 16,
                context_length: 8
            }
        ));
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let encoder = tiny_encoder();
        let generator = ScriptedGenerator::replying(&encoder, "the bot is good")
            .with_delay(Duration::from_millis(200));
        let engine =
            ChatEngine::start(generator, encoder, EngineOptions { queue_capacity: 1 }).unwrap();

        let prompt = engine
            .prepare(&[ChatMessage::user("hello")], &SamplingParams::greedy(4))
            .unwrap();
        let results: Vec<_> = (0..3)
            .map(|_| engine.generate_stream(prompt.clone(), SamplingParams::greedy(4)))
            .collect();

        assert!(results.first().is_some_and(|r| r.is_ok()));
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(EngineError::QueueFull { capacity: 1 }))),
            "expected at least one rejection"
        );
    }

    #[tokio::test]
    async fn requests_are_served_in_turn() {
        let engine = engine_replying("good move");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .complete(&[ChatMessage::user("e4")], SamplingParams::greedy(8))
                        .await
                })
            })
            .collect();
        for handle in handles {
            let completion = handle.await.unwrap().unwrap();
            assert_eq!(completion.text, "good move");
        }
    }

    #[tokio::test]
    async fn invalid_sampling_is_rejected() {
        let engine = engine_replying("e5");
        let params = SamplingParams {
            top_p: 1.5,
            ..SamplingParams::default()
        };
        let err = engine
            .complete(&[ChatMessage::user("e4")], params)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSampling(_)));
    }

    #[tokio::test]
    async fn dropped_stream_does_not_block_the_worker() {
        let engine = engine_replying("the bot is good");
        let prompt = engine
            .prepare(&[ChatMessage::user("hello")], &SamplingParams::greedy(4))
            .unwrap();
        drop(engine.generate_stream(prompt, SamplingParams::greedy(4)).unwrap());

        let completion = engine
            .complete(&[ChatMessage::user("hello")], SamplingParams::greedy(4))
            .await
            .unwrap();
        assert_eq!(completion.completion_tokens, 4);
        assert_eq!(completion.finish_reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn dropping_a_running_stream_cancels_generation() {
        let encoder = tiny_encoder();
        let reply = "the bot is good the bot is good the bot is good";
        let generator =
            ScriptedGenerator::replying(&encoder, reply).with_delay(Duration::from_millis(100));
        let calls = generator.calls();
        let engine = ChatEngine::start(generator, encoder, EngineOptions::default()).unwrap();

        let prompt = engine
            .prepare(&[ChatMessage::user("hello")], &SamplingParams::greedy(12))
            .unwrap();
        let mut stream = engine.generate_stream(prompt, SamplingParams::greedy(12)).unwrap();
        assert!(matches!(stream.recv().await, Some(GenerationEvent::Delta(_))));
        drop(stream);

        // The worker is free again once the abandoned generation stops.
        let next = engine
            .complete(&[ChatMessage::user("hello")], SamplingParams::greedy(1))
            .await
            .unwrap();
        assert_eq!(next.completion_tokens, 1);

        // Prefill + one step for the follow-up, plus whatever the
        // cancelled run managed before noticing the dropped receiver.
        let cancelled_run = calls.lock().unwrap().len() - 1;
        assert!(
            cancelled_run < 6,
            "cancelled generation ran {cancelled_run} forward passes"
        );
    }
}
