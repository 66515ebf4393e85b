use super::ModelMeta;
use crate::core::cache::{CausalKVCache, KVCache};
use crate::core::{Result, TokenId};
use crate::lora::LoraLinear;
use crate::media::MediaItem;
use candle_core::{Device, Tensor};

/// Weights-and-math half of a vision-language model. Implementations are
/// immutable during decoding; only adapter application needs `&mut self`.
pub trait VisionLanguageModel: Send + Sync {
    fn meta(&self) -> &ModelMeta;
    fn device(&self) -> &Device;

    /// `[seq, hidden]` text embeddings.
    fn embed_tokens(&self, tokens: &[TokenId]) -> Result<Tensor>;

    /// `[vision_tokens, hidden]` embeddings for one preprocessed item.
    fn encode_media(&self, item: &MediaItem) -> Result<Tensor>;

    /// Runs `[seq, hidden]` embeddings starting at position `offset` and
    /// returns next-token logits `[vocab]` for the last position.
    fn forward_embeds(&self, embeds: &Tensor, offset: usize, cache: &mut dyn KVCache) -> Result<Tensor>;

    fn new_cache(&self, max_seq_len: usize) -> Box<dyn KVCache> {
        Box::new(CausalKVCache::new(self.meta().num_layers, 2, max_seq_len))
    }

    /// Linear layers an adapter may patch, by dotted module name.
    fn lora_targets(&mut self) -> Vec<(String, &mut LoraLinear)> {
        Vec::new()
    }
}
