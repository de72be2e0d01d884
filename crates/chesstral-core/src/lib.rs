//! Local inference for a Mistral model fine-tuned with a LoRA adapter.
//!
//! [`ChatEngine`] is the entry point: it loads the model once, hands it to a
//! dedicated worker thread and accepts chat conversations from any task.

mod worker;

pub mod chat;
pub mod engine;
pub mod error;
pub mod generator;
pub mod model;
pub mod sampling;
pub mod template;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chat::{ChatMessage, Role};
pub use engine::{ChatEngine, Completion, EngineOptions, GenerationStream, collect_completion};
pub use error::EngineError;
pub use model::{DeviceSpec, LoadOptions, ModelDType, ModelPaths};
pub use sampling::SamplingParams;
pub use template::PromptEncoder;
pub use worker::{FinishReason, GenerationEvent};
