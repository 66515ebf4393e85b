pub mod backend;
pub mod config;
pub mod registry;
pub mod store;
pub mod traits;

pub use backend::{BackendCreator, BackendRegistry};
pub use config::{
    ConfigValue, FromConfigValue, ImagePreprocessing, IntoConfigValue, MediaLayout, ModelConfig,
    BuiltinAdapter, InputMode, ModelConfigBuilder, PlaceholderPlacement, ResizePolicy, VideoPreprocessing, VideoTokenFormula,
    VisionTokenFormula,
};
pub use registry::{lookup, resolve, resolve_metadata, resolve_with, ArchitectureFamily};
pub use store::{LocalModelStore, MetadataLoader, RawMetadata};
pub use traits::VisionLanguageModel;

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TokenId(pub u32);

impl TokenId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub name: String,
    pub family: ArchitectureFamily,
    pub hidden_size: usize,
    pub vocab_size: usize,
    pub num_layers: usize,
    pub context_length: usize,
    pub quantization: Option<String>,
}

impl ModelMeta {
    /// Metadata for a loaded backend; the dimensions come from its weights.
    pub fn new(
        name: impl Into<String>,
        config: &ModelConfig,
        hidden_size: usize,
        vocab_size: usize,
        num_layers: usize,
    ) -> Self {
        Self {
            name: name.into(),
            family: config.family,
            hidden_size,
            vocab_size,
            num_layers,
            context_length: config.context_length,
            quantization: None,
        }
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Some(quantization.into());
        self
    }
}
