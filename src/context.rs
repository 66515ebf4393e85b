//! A loaded model with its resolved config and tokenizer, and the
//! end-to-end entry points over them.

use crate::core::model::{registry, store::read_metadata, BackendRegistry, InputMode, LocalModelStore};
use crate::core::{HfTokenizer, ModelConfig, ModelMeta, Result, TokenId, Tokenizer, VisionLanguageModel};
use crate::encoder;
use crate::generate::{GenerateOptions, GenerationOutput, GenerationStream};
use crate::lora::{self, LoraMode, LoraWeights};
use crate::media::{self, MediaItem, MediaKind, MediaOptions, MediaSource};
use crate::prompt::{self, ComposedSequence, PromptSpec};
use candle_core::Device;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ModelContext {
    config: ModelConfig,
    model: Arc<RwLock<Box<dyn VisionLanguageModel>>>,
    tokenizer: Arc<dyn Tokenizer>,
    device: Device,
}

impl ModelContext {
    pub fn new(config: ModelConfig, model: Box<dyn VisionLanguageModel>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        let device = model.device().clone();
        Self {
            config,
            model: Arc::new(RwLock::new(model)),
            tokenizer,
            device,
        }
    }

    /// Resolves `path_or_id` through the environment's model store and
    /// builds the backend registered for its family.
    pub fn load(path_or_id: &str, backends: &BackendRegistry, device: &Device) -> Result<Self> {
        Self::load_from(&LocalModelStore::from_env(), path_or_id, backends, device)
    }

    pub fn load_from(
        store: &LocalModelStore,
        path_or_id: &str,
        backends: &BackendRegistry,
        device: &Device,
    ) -> Result<Self> {
        let dir = store.locate(path_or_id)?;
        let config = registry::resolve_metadata(&read_metadata(&dir)?)?;
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(HfTokenizer::from_model_dir(&dir)?);
        let model = backends.create(&config, &dir, device)?;
        info!(model = %path_or_id, family = %config.family, "model loaded");
        Ok(Self::new(config, model, tokenizer))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> Arc<dyn Tokenizer> {
        Arc::clone(&self.tokenizer)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn meta(&self) -> ModelMeta {
        self.model.read().meta().clone()
    }

    pub fn preprocess(&self, source: MediaSource, kind: MediaKind, options: &MediaOptions) -> Result<MediaItem> {
        media::preprocess(source, kind, &self.config, options, &self.device)
    }

    pub fn compose(&self, spec: &PromptSpec<'_>) -> Result<ComposedSequence> {
        prompt::compose(spec, &self.config, self.tokenizer.as_ref())
    }

    /// Composes and encodes the prompt, then returns a lazy token stream.
    pub fn generate(&self, spec: &PromptSpec<'_>, options: GenerateOptions) -> Result<GenerationStream> {
        let composed = self.compose(spec)?;
        self.select_builtin_adapter(spec)?;
        let embeds = {
            let model = self.model.read();
            encoder::encode(&**model, &self.config, &composed, spec.media)?
        };
        GenerationStream::new(
            Arc::clone(&self.model),
            Arc::clone(&self.tokenizer),
            embeds,
            self.config.context_length,
            &self.eos_token_ids(),
            options,
        )
    }

    pub fn generate_text(&self, spec: &PromptSpec<'_>, options: GenerateOptions) -> Result<GenerationOutput> {
        self.generate(spec, options)?.collect_output()
    }

    /// Models that ship a vision adapter run with it for requests carrying
    /// media and without any adapter for text-only requests.
    fn select_builtin_adapter(&self, spec: &PromptSpec<'_>) -> Result<()> {
        let Some(vision) = self.config.builtin_adapter(InputMode::Vision) else {
            return Ok(());
        };
        let wanted = (!spec.media.is_empty()).then_some(vision.name.as_str());
        let mut model = self.model.write();
        lora::set_active_adapter(&mut **model, wanted)?;
        debug!(adapter = ?wanted, "selected built-in adapter");
        Ok(())
    }

    /// Configured EOS ids plus the ids of the configured EOS strings.
    pub fn eos_token_ids(&self) -> Vec<TokenId> {
        let mut ids = self.config.eos_token_ids.clone();
        for token in &self.config.eos_tokens {
            if let Some(id) = self.tokenizer.token_to_id(token) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Takes the write lock, so it waits for in-flight decode steps.
    pub fn apply_lora(&self, weights: &LoraWeights, mode: LoraMode) -> Result<Vec<String>> {
        let mut model = self.model.write();
        lora::apply(&mut **model, weights, mode)
    }

    pub fn set_active_adapter(&self, name: Option<&str>) -> Result<usize> {
        let mut model = self.model.write();
        lora::set_active_adapter(&mut **model, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TinyVlm};

    fn context() -> ModelContext {
        let config = testing::config();
        let model = TinyVlm::new(&config, &Device::Cpu).unwrap();
        ModelContext::new(config, Box::new(model), Arc::new(testing::tokenizer()))
    }

    #[test]
    fn test_eos_ids_deduplicated() {
        let ctx = context();
        let eos = testing::tokenizer().token_to_id(testing::EOS).unwrap();
        assert_eq!(ctx.eos_token_ids(), vec![eos]);
    }

    #[test]
    fn test_generate_respects_budget() {
        let ctx = context();
        let media = vec![testing::image_item(32, 32)];
        let options = GenerateOptions {
            max_tokens: 5,
            ..Default::default()
        };
        let output = ctx.generate_text(&PromptSpec::new("describe the image", &media), options).unwrap();
        assert_eq!(output.token_count(), 5);
        assert!(!output.text.is_empty());
    }

    #[test]
    fn test_load_from_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalModelStore::new(vec![dir.path().to_path_buf()]);
        let backends = BackendRegistry::new();
        assert!(ModelContext::load_from(&store, "org/missing", &backends, &Device::Cpu).is_err());
    }
}
