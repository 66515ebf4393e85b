//! Small deterministic stand-ins for a tokenizer and a model, used by the
//! unit and integration tests.

use crate::core::model::{
    ArchitectureFamily, MediaLayout, ModelConfig, ModelMeta, ResizePolicy, VideoTokenFormula, VisionTokenFormula,
};
use crate::core::tokenizer::{DecodeOptions, EncodeOptions};
use crate::core::{CausalKVCache, KVCache, Result, TokenId, Tokenizer, VisionLanguageModel, VlmError};
use crate::lora::LoraLinear;
use crate::media::{video::VideoSampling, MediaItem};
use candle_core::{DType, Device, IndexOp, Tensor};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const UNK: &str = "<unk>";
pub const EOS: &str = "</s>";

const SPECIAL: &[&str] = &[
    "<s>",
    EOS,
    "<image>",
    "<video>",
    "<|image_pad|>",
    "<|video_pad|>",
    "<|vision_start|>",
    "<|vision_end|>",
    "<|im_start|>",
    "<|im_end|>",
    "\n",
];

const WORDS: &[&str] = &[
    "USER:", "ASSISTANT:", "SYSTEM:", "system", "user", "assistant", "describe", "the", "image", "video", "a",
    "cat", "dog", "sat", "on", "mat", "what", "is", "in", "this", "be", "brief", "red", "blue",
];

const TEMPLATE: &str = "{% for message in messages %}{{ message['role'] | upper }}: {% for item in message['content'] %}{% if item['type'] == 'image' %}<image>{% elif item['type'] == 'video' %}<video>{% else %}{{ item['text'] }}{% endif %}{% endfor %}\n{% endfor %}{% if add_generation_prompt %}ASSISTANT:{% endif %}";

/// Whitespace word tokenizer. Special tokens are matched anywhere in the
/// text before splitting; unknown words map to `<unk>` at id 0.
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    vocab: Vec<String>,
    ids: HashMap<String, TokenId>,
    special: Vec<String>,
    special_ids: HashSet<TokenId>,
}

impl WordTokenizer {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tokenizer = Self {
            vocab: Vec::new(),
            ids: HashMap::new(),
            special: Vec::new(),
            special_ids: HashSet::new(),
        };
        tokenizer.insert(UNK.to_string());
        for word in words {
            tokenizer.insert(word.into());
        }
        tokenizer
    }

    pub fn with_special<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for token in tokens {
            let token = token.into();
            let id = self.insert(token.clone());
            if self.special_ids.insert(id) {
                self.special.push(token);
            }
        }
        // longest first so overlapping specials resolve greedily
        self.special.sort_by_key(|s| std::cmp::Reverse(s.len()));
        self
    }

    fn insert(&mut self, token: String) -> TokenId {
        if let Some(id) = self.ids.get(&token) {
            return *id;
        }
        let id = TokenId(self.vocab.len() as u32);
        self.ids.insert(token.clone(), id);
        self.vocab.push(token);
        id
    }

    /// Ids of plain words, in vocabulary order.
    pub fn word_ids(&self) -> Vec<TokenId> {
        (1..self.vocab.len() as u32)
            .map(TokenId)
            .filter(|id| !self.special_ids.contains(id))
            .collect()
    }

    fn encode_words(&self, text: &str, out: &mut Vec<TokenId>) {
        for word in text.split_whitespace() {
            out.push(self.ids.get(word).copied().unwrap_or(TokenId(0)));
        }
    }
}

impl Tokenizer for WordTokenizer {
    fn encode_with_options(&self, text: &str, options: &EncodeOptions) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if options.add_special_tokens {
            if let Some(bos) = self.ids.get("<s>") {
                tokens.push(*bos);
            }
        }

        let mut rest = text;
        while !rest.is_empty() {
            let next = self
                .special
                .iter()
                .filter_map(|s| rest.find(s.as_str()).map(|at| (at, s)))
                .min_by_key(|(at, _)| *at);
            match next {
                Some((at, special)) => {
                    self.encode_words(&rest[..at], &mut tokens);
                    tokens.push(self.ids[special]);
                    rest = &rest[at + special.len()..];
                }
                None => {
                    self.encode_words(rest, &mut tokens);
                    break;
                }
            }
        }

        if let Some(max_len) = options.truncate {
            tokens.truncate(max_len);
        }
        Ok(tokens)
    }

    fn decode_with_options(&self, tokens: &[TokenId], options: &DecodeOptions) -> Result<String> {
        let mut words = Vec::with_capacity(tokens.len());
        for id in tokens {
            if options.skip_special_tokens && self.special_ids.contains(id) {
                continue;
            }
            let word = self
                .vocab
                .get(id.as_usize())
                .ok_or_else(|| VlmError::Tokenizer(format!("token id {id} out of range")))?;
            words.push(word.as_str());
        }
        Ok(words.join(" "))
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.ids.get(token).copied()
    }

    fn id_to_token(&self, id: TokenId) -> Option<String> {
        self.vocab.get(id.as_usize()).cloned()
    }
}

/// The shared test vocabulary.
pub fn tokenizer() -> WordTokenizer {
    WordTokenizer::new(WORDS.iter().copied()).with_special(SPECIAL.iter().copied())
}

/// Llava-shaped config small enough for `TinyVlm`: 4 tokens per image,
/// 2 per video frame, 32x32 inputs.
pub fn config() -> ModelConfig {
    let tokenizer = tokenizer();
    let mut builder = ModelConfig::builder(ArchitectureFamily::Llava)
        .model_type("llava")
        .layout(MediaLayout::Interleaved {
            separator: "\n".to_string(),
        })
        .image_tokens(VisionTokenFormula::Fixed(4))
        .video_token("<video>")
        .video_tokens(VideoTokenFormula {
            per_frame: VisionTokenFormula::Fixed(2),
            temporal_patch_size: 1,
        })
        .resize(ResizePolicy::Fixed { width: 32, height: 32 })
        .chat_template(TEMPLATE)
        .bos_token("<s>")
        .eos_tokens([EOS])
        .context_length(512);
    if let Some(eos) = tokenizer.token_to_id(EOS) {
        builder = builder.eos_token_ids(vec![eos]);
    }
    builder.build()
}

pub fn image_item(width: usize, height: usize) -> MediaItem {
    MediaItem::Image {
        pixels: zeros(&[3, height, width]),
        original_size: (width, height),
    }
}

pub fn video_item(frames: usize, width: usize, height: usize) -> MediaItem {
    MediaItem::Video {
        frames: zeros(&[frames, 3, height, width]),
        sampling: VideoSampling {
            source_fps: 1.0,
            total_frames: frames,
            fps: 1.0,
            indices: (0..frames).collect(),
            original_size: (width, height),
        },
    }
}

fn zeros(shape: &[usize]) -> Tensor {
    // allocation of a CPU zero tensor only fails on OOM
    Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap_or_else(|e| panic!("zero tensor: {e}"))
}

fn one_hot_rows(rows: impl IntoIterator<Item = usize>, width: usize, device: &Device) -> Result<Tensor> {
    let rows: Vec<usize> = rows.into_iter().collect();
    let mut data = vec![0f32; rows.len() * width];
    for (r, col) in rows.iter().enumerate() {
        if *col >= width {
            return Err(VlmError::Tokenizer(format!("token id {col} out of range")));
        }
        data[r * width + col] = 1.0;
    }
    Ok(Tensor::from_vec(data, (rows.len(), width), device)?)
}

fn vision_rows(config: &ModelConfig, item: &MediaItem, drift: usize, hidden: usize, device: &Device) -> Result<Tensor> {
    let count = config.vision_token_count(item)? + drift;
    let mean = item.pixels().mean_all()?.to_scalar::<f32>()?;
    Ok(Tensor::full(mean + 0.5, (count, hidden), device)?)
}

/// A bigram model over the test vocabulary. Embeddings are one-hot, the
/// single layer is an identity `o_proj`, and the head maps each word to the
/// next word of the vocabulary. It never predicts `</s>`.
pub struct TinyVlm {
    meta: ModelMeta,
    config: ModelConfig,
    device: Device,
    o_proj: LoraLinear,
    lm_head: Tensor,
    drift: usize,
}

impl TinyVlm {
    pub const O_PROJ: &'static str = "model.layers.0.self_attn.o_proj";

    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let tokenizer = tokenizer();
        let vocab = tokenizer.vocab_size();
        let words = tokenizer.word_ids();

        let mut next = vec![words[0].as_usize(); vocab];
        for (i, word) in words.iter().enumerate() {
            next[word.as_usize()] = words[(i + 1) % words.len()].as_usize();
        }
        // lm_head[next(t), t] = 1
        let mut head = vec![0f32; vocab * vocab];
        for (t, n) in next.iter().enumerate() {
            head[n * vocab + t] = 1.0;
        }
        let lm_head = Tensor::from_vec(head, (vocab, vocab), device)?;
        let o_proj = LoraLinear::dense(Self::O_PROJ, one_hot_rows(0..vocab, vocab, device)?, None)?;

        Ok(Self {
            meta: ModelMeta::new("tiny-vlm", config, vocab, vocab, 1),
            config: config.clone(),
            device: device.clone(),
            o_proj,
            lm_head,
            drift: 0,
        })
    }

    /// Makes the vision encoder return `drift` extra rows per item.
    pub fn with_token_drift(mut self, drift: usize) -> Self {
        self.drift = drift;
        self
    }

    pub fn hidden_size(&self) -> usize {
        self.meta.hidden_size
    }
}

impl VisionLanguageModel for TinyVlm {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn embed_tokens(&self, tokens: &[TokenId]) -> Result<Tensor> {
        one_hot_rows(tokens.iter().map(|t| t.as_usize()), self.meta.hidden_size, &self.device)
    }

    fn encode_media(&self, item: &MediaItem) -> Result<Tensor> {
        vision_rows(&self.config, item, self.drift, self.meta.hidden_size, &self.device)
    }

    fn forward_embeds(&self, embeds: &Tensor, offset: usize, cache: &mut dyn KVCache) -> Result<Tensor> {
        if offset != cache.len() {
            return Err(VlmError::InvalidConfig(format!(
                "forward at position {offset} but cache holds {}",
                cache.len()
            )));
        }
        cache.update(0, embeds, embeds)?;
        let seq = embeds.dim(0)?;
        if seq == 0 {
            return Err(VlmError::InvalidPrompt("empty input sequence".into()));
        }
        let last = embeds.i(seq - 1)?.unsqueeze(0)?;
        let hidden = self.o_proj.forward(&last)?;
        Ok(hidden.matmul(&self.lm_head.t()?)?.squeeze(0)?)
    }

    fn new_cache(&self, max_seq_len: usize) -> Box<dyn KVCache> {
        Box::new(CausalKVCache::new(1, 0, max_seq_len))
    }

    fn lora_targets(&mut self) -> Vec<(String, &mut LoraLinear)> {
        vec![(Self::O_PROJ.to_string(), &mut self.o_proj)]
    }
}

/// Emits a fixed token script, one token per forward pass, restarting
/// whenever a new prompt is prefilled. Repeats the last token once the
/// script runs out.
pub struct ScriptedModel {
    meta: ModelMeta,
    config: ModelConfig,
    device: Device,
    script: Vec<TokenId>,
    step: AtomicUsize,
    fail_at: Option<usize>,
}

impl ScriptedModel {
    pub fn new(config: &ModelConfig, script: Vec<TokenId>) -> Self {
        let vocab = tokenizer().vocab_size();
        Self {
            meta: ModelMeta::new("scripted", config, vocab, vocab, 1),
            config: config.clone(),
            device: Device::Cpu,
            script,
            step: AtomicUsize::new(0),
            fail_at: None,
        }
    }

    /// Makes forward pass number `step` (0 is the prefill) fail.
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }
}

impl VisionLanguageModel for ScriptedModel {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn embed_tokens(&self, tokens: &[TokenId]) -> Result<Tensor> {
        one_hot_rows(tokens.iter().map(|t| t.as_usize()), self.meta.hidden_size, &self.device)
    }

    fn encode_media(&self, item: &MediaItem) -> Result<Tensor> {
        vision_rows(&self.config, item, 0, self.meta.hidden_size, &self.device)
    }

    fn forward_embeds(&self, _embeds: &Tensor, offset: usize, _cache: &mut dyn KVCache) -> Result<Tensor> {
        if offset == 0 {
            self.step.store(0, Ordering::SeqCst);
        }
        let step = self.step.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(step) {
            return Err(VlmError::InvalidLogits(format!("forward pass {} failed", step)));
        }
        let token = self
            .script
            .get(step)
            .or_else(|| self.script.last())
            .map_or(0, |t| t.as_usize());
        let mut logits = vec![0f32; self.meta.vocab_size];
        logits[token] = 10.0;
        Ok(Tensor::from_vec(logits, self.meta.vocab_size, &self.device)?)
    }
}
