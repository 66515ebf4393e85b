pub mod context;
pub mod core;
pub mod encoder;
pub mod envconfig;
pub mod generate;
pub mod lora;
pub mod media;
pub mod prompt;
pub mod template;
#[doc(hidden)]
pub mod testing;

pub mod model {
    pub use crate::core::model::*;
}

pub use context::ModelContext;

pub use core::{
    select_device, CausalKVCache, HfTokenizer, KVCache, ModelConfig, ModelMeta, Result, TokenId, TokenStream,
    Tokenizer, VisionLanguageModel, VlmError,
};

pub use core::model::{ArchitectureFamily, BackendRegistry, LocalModelStore};

pub use generate::{CancellationToken, GenerateOptions, GenerationOutput, GenerationStream, SamplingParams, StopReason};

pub use lora::{LoraMode, LoraWeights};

pub use media::{MediaItem, MediaKind, MediaOptions, MediaSource};

pub use prompt::{compose, ComposedSequence, PlaceholderSpan, PromptSpec};
