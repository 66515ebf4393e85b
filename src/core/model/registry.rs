use super::config::{
    ModelConfig, ModelConfigBuilder, PlaceholderPlacement, ResizePolicy, VideoTokenFormula,
    VisionTokenFormula, CLIP_MEAN, CLIP_STD, HALF_MEAN, HALF_STD,
};
use super::config::{BuiltinAdapter, ConfigValue, InputMode, MediaLayout};
use super::store::{LocalModelStore, MetadataLoader, RawMetadata};
use super::TokenId;
use crate::core::{Result, VlmError};
use crate::lora::{AdapterConfig, TargetMatcher};
use once_cell::sync::Lazy;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchitectureFamily {
    Llava,
    BunnyLlama,
    Paligemma,
    Qwen2Vl,
    Qwen25Vl,
    Idefics2,
    Idefics3,
    SmolVlm,
    Phi3V,
    Phi4Mm,
    Pixtral,
    Florence2,
    Molmo,
    Gemma3,
    MultiModality,
}

impl ArchitectureFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchitectureFamily::Llava => "llava",
            ArchitectureFamily::BunnyLlama => "bunny-llama",
            ArchitectureFamily::Paligemma => "paligemma",
            ArchitectureFamily::Qwen2Vl => "qwen2_vl",
            ArchitectureFamily::Qwen25Vl => "qwen2_5_vl",
            ArchitectureFamily::Idefics2 => "idefics2",
            ArchitectureFamily::Idefics3 => "idefics3",
            ArchitectureFamily::SmolVlm => "smolvlm",
            ArchitectureFamily::Phi3V => "phi3_v",
            ArchitectureFamily::Phi4Mm => "phi4mm",
            ArchitectureFamily::Pixtral => "pixtral",
            ArchitectureFamily::Florence2 => "florence2",
            ArchitectureFamily::Molmo => "molmo",
            ArchitectureFamily::Gemma3 => "gemma3",
            ArchitectureFamily::MultiModality => "multi_modality",
        }
    }

    pub fn all() -> impl Iterator<Item = ArchitectureFamily> {
        ARCHITECTURES.iter().map(|spec| spec.family)
    }

    pub fn from_model_type(model_type: &str) -> Option<Self> {
        BY_MODEL_TYPE.get(normalize(model_type).as_str()).map(|spec| spec.family)
    }
}

impl fmt::Display for ArchitectureFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ArchitectureFamily {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

struct ArchitectureSpec {
    family: ArchitectureFamily,
    model_types: &'static [&'static str],
    hf_architectures: &'static [&'static str],
    image_token: &'static str,
    /// Closes each patch row for `PatchRows` formulas.
    break_token: Option<&'static str>,
    video_token: Option<&'static str>,
    placement: PlaceholderPlacement,
    separator: Option<&'static str>,
    image_tokens: VisionTokenFormula,
    video_tokens: Option<VideoTokenFormula>,
    resize: ResizePolicy,
    mean: [f32; 3],
    std: [f32; 3],
    chat_template: &'static str,
    bos_token: Option<&'static str>,
    eos_tokens: &'static [&'static str],
    context_length: usize,
}

impl ArchitectureSpec {
    fn builder(&self) -> ModelConfigBuilder {
        let mut builder = ModelConfig::builder(self.family)
            .image_token(self.image_token)
            .placement(self.placement)
            .layout(match self.separator {
                Some(separator) => MediaLayout::Interleaved {
                    separator: separator.to_string(),
                },
                None => MediaLayout::Grouped,
            })
            .image_tokens(self.image_tokens)
            .resize(self.resize)
            .normalize(self.mean, self.std)
            .chat_template(self.chat_template)
            .eos_tokens(self.eos_tokens.iter().copied())
            .context_length(self.context_length);

        if let (Some(token), Some(formula)) = (self.video_token, self.video_tokens) {
            builder = builder.video_token(token).video_tokens(formula);
        }
        if let Some(bos) = self.bos_token {
            builder = builder.bos_token(bos);
        }
        if let Some(token) = self.break_token {
            builder = builder.image_break_token(token);
        }
        builder
    }
}

const QWEN_VL_MAX_PIXELS: usize = 28 * 28 * 1280;

static ARCHITECTURES: &[ArchitectureSpec] = &[
    ArchitectureSpec {
        family: ArchitectureFamily::Llava,
        model_types: &["llava", "llava_qwen2"],
        hf_architectures: &["LlavaForConditionalGeneration"],
        image_token: "<image>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: Some("\n"),
        image_tokens: VisionTokenFormula::Fixed(576),
        video_tokens: None,
        resize: ResizePolicy::Fixed { width: 336, height: 336 },
        mean: CLIP_MEAN,
        std: CLIP_STD,
        chat_template: USER_ASSISTANT_TEMPLATE,
        bos_token: Some("<s>"),
        eos_tokens: &["</s>"],
        context_length: 4096,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::BunnyLlama,
        model_types: &["bunny-llama", "bunny_llama"],
        hf_architectures: &["BunnyLlamaForCausalLM"],
        image_token: "<image>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: Some("\n"),
        image_tokens: VisionTokenFormula::Fixed(729),
        video_tokens: None,
        resize: ResizePolicy::Fixed { width: 384, height: 384 },
        mean: HALF_MEAN,
        std: HALF_STD,
        chat_template: USER_ASSISTANT_TEMPLATE,
        bos_token: Some("<|begin_of_text|>"),
        eos_tokens: &["<|eot_id|>", "<|end_of_text|>"],
        context_length: 8192,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Paligemma,
        model_types: &["paligemma"],
        hf_architectures: &["PaliGemmaForConditionalGeneration"],
        image_token: "<image>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Fixed(256),
        video_tokens: None,
        resize: ResizePolicy::Fixed { width: 224, height: 224 },
        mean: HALF_MEAN,
        std: HALF_STD,
        chat_template: PALIGEMMA_TEMPLATE,
        bos_token: Some("<bos>"),
        eos_tokens: &["<eos>"],
        context_length: 8192,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Qwen2Vl,
        model_types: &["qwen2_vl"],
        hf_architectures: &["Qwen2VLForConditionalGeneration"],
        image_token: "<|image_pad|>",
        break_token: None,
        video_token: Some("<|video_pad|>"),
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Patches {
            patch_size: 14,
            merge_size: 2,
        },
        video_tokens: Some(VideoTokenFormula {
            per_frame: VisionTokenFormula::Patches {
                patch_size: 14,
                merge_size: 2,
            },
            temporal_patch_size: 2,
        }),
        resize: ResizePolicy::Smart {
            factor: 28,
            min_pixels: 56 * 56,
            max_pixels: QWEN_VL_MAX_PIXELS,
        },
        mean: CLIP_MEAN,
        std: CLIP_STD,
        chat_template: CHATML_VL_TEMPLATE,
        bos_token: None,
        eos_tokens: &["<|im_end|>", "<|endoftext|>"],
        context_length: 32768,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Qwen25Vl,
        model_types: &["qwen2_5_vl"],
        hf_architectures: &["Qwen2_5_VLForConditionalGeneration"],
        image_token: "<|image_pad|>",
        break_token: None,
        video_token: Some("<|video_pad|>"),
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Patches {
            patch_size: 14,
            merge_size: 2,
        },
        video_tokens: Some(VideoTokenFormula {
            per_frame: VisionTokenFormula::Patches {
                patch_size: 14,
                merge_size: 2,
            },
            temporal_patch_size: 2,
        }),
        resize: ResizePolicy::Smart {
            factor: 28,
            min_pixels: 56 * 56,
            max_pixels: 12_845_056,
        },
        mean: CLIP_MEAN,
        std: CLIP_STD,
        chat_template: CHATML_VL_TEMPLATE,
        bos_token: None,
        eos_tokens: &["<|im_end|>", "<|endoftext|>"],
        context_length: 128_000,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Idefics2,
        model_types: &["idefics2"],
        hf_architectures: &["Idefics2ForConditionalGeneration"],
        image_token: "<image>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Fixed(64),
        video_tokens: None,
        resize: ResizePolicy::LongestEdge {
            edge: 980,
            multiple: 14,
        },
        mean: HALF_MEAN,
        std: HALF_STD,
        chat_template: IDEFICS_TEMPLATE,
        bos_token: Some("<s>"),
        eos_tokens: &["<end_of_utterance>", "</s>"],
        context_length: 32768,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Idefics3,
        model_types: &["idefics3"],
        hf_architectures: &["Idefics3ForConditionalGeneration"],
        image_token: "<image>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Tiled {
            tile_size: 364,
            tokens_per_tile: 169,
        },
        video_tokens: None,
        resize: ResizePolicy::LongestEdge {
            edge: 1456,
            multiple: 364,
        },
        mean: HALF_MEAN,
        std: HALF_STD,
        chat_template: IDEFICS3_TEMPLATE,
        bos_token: Some("<|begin_of_text|>"),
        eos_tokens: &["<end_of_utterance>", "<|end_of_text|>"],
        context_length: 10240,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::SmolVlm,
        model_types: &["smolvlm", "smolvlm2"],
        hf_architectures: &["SmolVLMForConditionalGeneration"],
        image_token: "<image>",
        break_token: None,
        video_token: Some("<video>"),
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Tiled {
            tile_size: 512,
            tokens_per_tile: 64,
        },
        video_tokens: Some(VideoTokenFormula {
            per_frame: VisionTokenFormula::Fixed(64),
            temporal_patch_size: 1,
        }),
        resize: ResizePolicy::LongestEdge {
            edge: 2048,
            multiple: 512,
        },
        mean: HALF_MEAN,
        std: HALF_STD,
        chat_template: SMOLVLM_TEMPLATE,
        bos_token: Some("<|im_start|>"),
        eos_tokens: &["<end_of_utterance>", "<|im_end|>"],
        context_length: 8192,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Phi3V,
        model_types: &["phi3_v"],
        hf_architectures: &["Phi3VForCausalLM"],
        image_token: "<|image|>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::Inline,
        separator: None,
        image_tokens: VisionTokenFormula::Tiled {
            tile_size: 336,
            tokens_per_tile: 144,
        },
        video_tokens: None,
        resize: ResizePolicy::LongestEdge {
            edge: 1344,
            multiple: 336,
        },
        mean: CLIP_MEAN,
        std: CLIP_STD,
        chat_template: PHI_TEMPLATE,
        bos_token: Some("<s>"),
        eos_tokens: &["<|end|>", "<|endoftext|>"],
        context_length: 131_072,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Phi4Mm,
        model_types: &["phi4mm", "phi4_multimodal"],
        hf_architectures: &["Phi4MMForCausalLM"],
        image_token: "<|endoftext10|>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Tiled {
            tile_size: 448,
            tokens_per_tile: 256,
        },
        video_tokens: None,
        resize: ResizePolicy::LongestEdge {
            edge: 1344,
            multiple: 448,
        },
        mean: HALF_MEAN,
        std: HALF_STD,
        chat_template: PHI4MM_TEMPLATE,
        bos_token: None,
        eos_tokens: &["<|end|>", "<|endoftext|>"],
        context_length: 131_072,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Pixtral,
        model_types: &["pixtral", "llava_pixtral", "mistral3"],
        hf_architectures: &["PixtralForConditionalGeneration", "Mistral3ForConditionalGeneration"],
        image_token: "[IMG]",
        break_token: Some("[IMG_BREAK]"),
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::PatchRows { patch_size: 16 },
        video_tokens: None,
        resize: ResizePolicy::LongestEdge {
            edge: 1024,
            multiple: 16,
        },
        mean: CLIP_MEAN,
        std: CLIP_STD,
        chat_template: PIXTRAL_TEMPLATE,
        bos_token: Some("<s>"),
        eos_tokens: &["</s>"],
        context_length: 131_072,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Florence2,
        model_types: &["florence2"],
        hf_architectures: &["Florence2ForConditionalGeneration"],
        image_token: "<image>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Fixed(577),
        video_tokens: None,
        resize: ResizePolicy::Fixed { width: 768, height: 768 },
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
        chat_template: FLORENCE2_TEMPLATE,
        bos_token: Some("<s>"),
        eos_tokens: &["</s>"],
        context_length: 1024,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Molmo,
        model_types: &["molmo"],
        hf_architectures: &["MolmoForCausalLM"],
        image_token: "<im_patch>",
        break_token: Some("<im_col>"),
        video_token: None,
        placement: PlaceholderPlacement::AfterText,
        separator: None,
        image_tokens: VisionTokenFormula::PatchRows { patch_size: 28 },
        video_tokens: None,
        resize: ResizePolicy::Fixed { width: 336, height: 336 },
        mean: CLIP_MEAN,
        std: CLIP_STD,
        chat_template: MOLMO_TEMPLATE,
        bos_token: None,
        eos_tokens: &["<|endoftext|>"],
        context_length: 4096,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::Gemma3,
        model_types: &["gemma3"],
        hf_architectures: &["Gemma3ForConditionalGeneration"],
        image_token: "<image_soft_token>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Fixed(256),
        video_tokens: None,
        resize: ResizePolicy::Fixed { width: 896, height: 896 },
        mean: HALF_MEAN,
        std: HALF_STD,
        chat_template: GEMMA3_TEMPLATE,
        bos_token: Some("<bos>"),
        eos_tokens: &["<end_of_turn>", "<eos>"],
        context_length: 131_072,
    },
    ArchitectureSpec {
        family: ArchitectureFamily::MultiModality,
        model_types: &["multi_modality"],
        hf_architectures: &["MultiModalityCausalLM"],
        image_token: "<image_placeholder>",
        break_token: None,
        video_token: None,
        placement: PlaceholderPlacement::BeforeText,
        separator: None,
        image_tokens: VisionTokenFormula::Fixed(576),
        video_tokens: None,
        resize: ResizePolicy::Fixed { width: 384, height: 384 },
        mean: HALF_MEAN,
        std: HALF_STD,
        chat_template: JANUS_TEMPLATE,
        bos_token: Some("<｜begin▁of▁sentence｜>"),
        eos_tokens: &["<｜end▁of▁sentence｜>"],
        context_length: 16384,
    },
];

static BY_MODEL_TYPE: Lazy<HashMap<String, &'static ArchitectureSpec>> = Lazy::new(|| {
    ARCHITECTURES
        .iter()
        .flat_map(|spec| spec.model_types.iter().map(move |t| (normalize(t), spec)))
        .collect()
});

static BY_HF_ARCHITECTURE: Lazy<HashMap<&'static str, &'static ArchitectureSpec>> = Lazy::new(|| {
    ARCHITECTURES
        .iter()
        .flat_map(|spec| spec.hf_architectures.iter().map(move |a| (*a, spec)))
        .collect()
});

fn normalize(model_type: &str) -> String {
    model_type.trim().to_ascii_lowercase().replace('-', "_")
}

fn spec_for(family: ArchitectureFamily) -> &'static ArchitectureSpec {
    // every variant has exactly one table row
    ARCHITECTURES
        .iter()
        .find(|spec| spec.family == family)
        .unwrap_or(&ARCHITECTURES[0])
}

pub fn lookup(model_type: &str) -> Result<ArchitectureFamily> {
    ArchitectureFamily::from_model_type(model_type)
        .ok_or_else(|| VlmError::UnknownArchitecture(model_type.to_string()))
}

/// Table defaults for a family, with no per-model overrides applied.
pub fn defaults(family: ArchitectureFamily) -> ModelConfig {
    spec_for(family).builder().build()
}

/// Resolves a local path or `org/name` id through the environment's model store.
pub fn resolve(path_or_id: &str) -> Result<ModelConfig> {
    resolve_with(&LocalModelStore::from_env(), path_or_id)
}

pub fn resolve_with<L: MetadataLoader + ?Sized>(loader: &L, path_or_id: &str) -> Result<ModelConfig> {
    let raw = loader.load_metadata(path_or_id)?;
    resolve_metadata(&raw)
}

pub fn resolve_metadata(raw: &RawMetadata) -> Result<ModelConfig> {
    let config = &raw.config;
    let model_type = config.get("model_type").and_then(Value::as_str);
    let architectures: Vec<&str> = config
        .get("architectures")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let spec = model_type
        .and_then(|t| BY_MODEL_TYPE.get(normalize(t).as_str()).copied())
        .or_else(|| {
            architectures
                .iter()
                .find_map(|a| BY_HF_ARCHITECTURE.get(*a).copied())
        })
        .ok_or_else(|| {
            let name = model_type
                .or_else(|| architectures.first().copied())
                .unwrap_or("<missing model_type>");
            VlmError::UnknownArchitecture(name.to_string())
        })?;

    let mut builder = spec.builder();
    if let Some(t) = model_type {
        builder = builder.model_type(t);
    }

    let text_config = config.get("text_config");
    let lookup_u64 = |keys: &[&str]| -> Option<u64> {
        keys.iter().find_map(|k| {
            config
                .get(*k)
                .or_else(|| text_config.and_then(|t| t.get(*k)))
                .and_then(Value::as_u64)
        })
    };

    if let Some(id) = lookup_u64(&["image_token_index", "image_token_id"]) {
        builder = builder.image_token_id(token_id(id)?);
    }
    if let Some(id) = lookup_u64(&["image_break_token_index", "image_break_token_id"]) {
        builder = builder.image_break_token_id(token_id(id)?);
    }
    if let Some(id) = lookup_u64(&["video_token_index", "video_token_id"]) {
        builder = builder.video_token_id(token_id(id)?);
    }
    if let Some(len) = lookup_u64(&["max_position_embeddings", "max_sequence_length"]) {
        builder = builder.context_length(len as usize);
    }
    if let Some(patch) = config
        .get("vision_config")
        .and_then(|v| v.get("patch_size"))
        .and_then(Value::as_u64)
    {
        builder = builder.patch_size(patch as usize);
    }
    for adapter in builtin_adapters(config)? {
        builder = builder.builtin_adapter(adapter);
    }

    let eos_ids = config
        .get("eos_token_id")
        .or_else(|| text_config.and_then(|t| t.get("eos_token_id")))
        .map(token_ids)
        .transpose()?;
    if let Some(ids) = eos_ids {
        builder = builder.eos_token_ids(ids);
    }

    if let Some(preprocessor) = &raw.preprocessor {
        builder = apply_preprocessor(builder, spec, preprocessor);
    }

    let mut eos_tokens: Vec<String> = spec.eos_tokens.iter().map(|s| s.to_string()).collect();
    if let Some(tokenizer) = &raw.tokenizer {
        if let Some(bos) = tokenizer.get("bos_token").and_then(special_token_content) {
            builder = builder.bos_token(bos);
        }
        if let Some(eos) = tokenizer.get("eos_token").and_then(special_token_content) {
            if !eos_tokens.contains(&eos) {
                eos_tokens.insert(0, eos);
            }
        }
        if let Some(template) = tokenizer.get("chat_template").and_then(chat_template_content) {
            builder = builder.chat_template(template);
        }
    }
    builder = builder.eos_tokens(eos_tokens);
    if let Some(template) = &raw.chat_template {
        builder = builder.chat_template(template.clone());
    }

    if let Some(object) = config.as_object() {
        for (key, value) in object {
            if let Some(value) = ConfigValue::from_json(value) {
                builder = builder.custom(key.clone(), value);
            }
        }
    }

    let resolved = builder.build();
    resolved.validate()?;
    debug!(
        family = %resolved.family,
        model_type = %resolved.model_type,
        context_length = resolved.context_length,
        "resolved model config"
    );
    Ok(resolved)
}

/// Adapters a model ships with and switches by input mode, such as phi4mm's
/// `vision_lora` and `speech_lora`. `dp` is a training-time dropout and is ignored.
fn builtin_adapters(config: &Value) -> Result<Vec<BuiltinAdapter>> {
    let mut adapters = Vec::new();
    for (key, name, mode) in [
        ("vision_lora", "vision", InputMode::Vision),
        ("speech_lora", "speech", InputMode::Speech),
    ] {
        let Some(value) = config.get(key).filter(|v| v.is_object()) else {
            continue;
        };
        let mut adapter = AdapterConfig::from_json(value)?;
        if let Some(layer) = value.get("layer").and_then(Value::as_str) {
            // the pattern names modules relative to the language model
            adapter.targets = TargetMatcher::pattern(&format!(r"(?:.*\.)?(?:{layer})"))?;
        }
        debug!(adapter = name, rank = adapter.rank, alpha = adapter.alpha, "built-in adapter declared");
        adapters.push(BuiltinAdapter {
            name: name.to_string(),
            mode,
            config: adapter,
        });
    }
    Ok(adapters)
}

fn apply_preprocessor(mut builder: ModelConfigBuilder, spec: &ArchitectureSpec, pre: &Value) -> ModelConfigBuilder {
    let triple = |key: &str| -> Option<[f32; 3]> {
        let values: Vec<f32> = pre
            .get(key)?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        <[f32; 3]>::try_from(values).ok()
    };
    if let (Some(mean), Some(std)) = (triple("image_mean"), triple("image_std")) {
        builder = builder.normalize(mean, std);
    }
    if let Some(factor) = pre.get("rescale_factor").and_then(Value::as_f64) {
        builder = builder.rescale_factor(factor as f32);
    }

    let size = pre.get("size");
    let size_key = |key: &str| -> Option<usize> {
        size.and_then(|s| s.get(key))
            .or_else(|| pre.get(key))
            .and_then(Value::as_u64)
            .map(|v| v as usize)
    };

    let resize = match spec.resize {
        ResizePolicy::Fixed { width, height } => ResizePolicy::Fixed {
            width: size_key("width").unwrap_or(width),
            height: size_key("height").unwrap_or(height),
        },
        ResizePolicy::LongestEdge { edge, multiple } => ResizePolicy::LongestEdge {
            edge: size_key("longest_edge").unwrap_or(edge),
            multiple,
        },
        ResizePolicy::Smart {
            factor,
            min_pixels,
            max_pixels,
        } => ResizePolicy::Smart {
            factor,
            min_pixels: pre
                .get("min_pixels")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .or_else(|| size_key("shortest_edge"))
                .unwrap_or(min_pixels),
            max_pixels: pre
                .get("max_pixels")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .or_else(|| size_key("longest_edge"))
                .unwrap_or(max_pixels),
        },
    };
    builder.resize(resize)
}

fn token_id(value: u64) -> Result<TokenId> {
    u32::try_from(value)
        .map(TokenId)
        .map_err(|_| VlmError::InvalidConfig(format!("token id {} out of range", value)))
}

fn token_ids(value: &Value) -> Result<Vec<TokenId>> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(|id| token_id(id).map(|t| vec![t]))
            .unwrap_or_else(|| Err(VlmError::InvalidConfig(format!("bad eos_token_id {}", n)))),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| VlmError::InvalidConfig(format!("bad eos_token_id {}", v)))
                    .and_then(token_id)
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(VlmError::InvalidConfig(format!("bad eos_token_id {}", other))),
    }
}

/// `"</s>"` or `{"content": "</s>", ...}`.
fn special_token_content(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("content").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

/// A template string, or a list of named templates of which `default` wins.
fn chat_template_content(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items
            .iter()
            .find(|t| t.get("name").and_then(Value::as_str) == Some("default"))
            .or_else(|| items.first())
            .and_then(|t| t.get("template"))
            .and_then(Value::as_str)
            .map(String::from),
        _ => None,
    }
}

const USER_ASSISTANT_TEMPLATE: &str = "{% for message in messages %}{% if message['role'] == 'system' %}{{ message['content'][0]['text'] }}\n{% else %}{{ message['role'] | upper }}: {% for item in message['content'] %}{% if item['type'] == 'image' %}<image>{% else %}{{ item['text'] }}{% endif %}{% endfor %}\n{% endif %}{% endfor %}{% if add_generation_prompt %}ASSISTANT:{% endif %}";

const PALIGEMMA_TEMPLATE: &str = "{% for message in messages %}{% for item in message['content'] %}{% if item['type'] == 'image' %}<image>{% endif %}{% endfor %}{% endfor %}{{ bos_token }}{% for message in messages %}{% if message['role'] == 'user' %}{% for item in message['content'] %}{% if item['type'] == 'text' %}{{ item['text'] }}{% endif %}{% endfor %}{% endif %}{% endfor %}\n";

const CHATML_VL_TEMPLATE: &str = "{% if messages[0]['role'] != 'system' %}<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n{% endif %}{% for message in messages %}<|im_start|>{{ message['role'] }}\n{% for item in message['content'] %}{% if item['type'] == 'image' %}<|vision_start|><|image_pad|><|vision_end|>{% elif item['type'] == 'video' %}<|vision_start|><|video_pad|><|vision_end|>{% else %}{{ item['text'] }}{% endif %}{% endfor %}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

const IDEFICS_TEMPLATE: &str = "{% for message in messages %}{{ message['role'] | capitalize }}{% if message['content'][0]['type'] == 'image' %}:{% else %}: {% endif %}{% for item in message['content'] %}{% if item['type'] == 'text' %}{{ item['text'] }}{% elif item['type'] == 'image' %}<fake_token_around_image><image><fake_token_around_image>{% endif %}{% endfor %}<end_of_utterance>\n{% endfor %}{% if add_generation_prompt %}Assistant:{% endif %}";

const IDEFICS3_TEMPLATE: &str = "{{ bos_token }}{% for message in messages %}{{ message['role'] | capitalize }}{% if message['content'][0]['type'] == 'image' %}:{% else %}: {% endif %}{% for item in message['content'] %}{% if item['type'] == 'text' %}{{ item['text'] }}{% elif item['type'] == 'image' %}<fake_token_around_image><global-img><image><fake_token_around_image>{% endif %}{% endfor %}<end_of_utterance>\n{% endfor %}{% if add_generation_prompt %}Assistant:{% endif %}";

const SMOLVLM_TEMPLATE: &str = "<|im_start|>{% for message in messages %}{{ message['role'] | capitalize }}{% if message['content'][0]['type'] in ['image', 'video'] %}:{% else %}: {% endif %}{% for item in message['content'] %}{% if item['type'] == 'text' %}{{ item['text'] }}{% elif item['type'] == 'image' %}<image>{% elif item['type'] == 'video' %}<video>{% endif %}{% endfor %}<end_of_utterance>\n{% endfor %}{% if add_generation_prompt %}Assistant:{% endif %}";

const PHI_TEMPLATE: &str = "{% for message in messages %}<|{{ message['role'] }}|>\n{% for item in message['content'] %}{% if item['type'] == 'image' %}<|image|>{% else %}{{ item['text'] }}{% endif %}{% endfor %}<|end|>\n{% endfor %}{% if add_generation_prompt %}<|assistant|>\n{% endif %}";

const PHI4MM_TEMPLATE: &str = "{% for message in messages %}<|{{ message['role'] }}|>{% for item in message['content'] %}{% if item['type'] == 'image' %}<|endoftext10|>{% else %}{{ item['text'] }}{% endif %}{% endfor %}<|end|>{% endfor %}{% if add_generation_prompt %}<|assistant|>{% endif %}";

const PIXTRAL_TEMPLATE: &str = "{{ bos_token }}{% for message in messages %}{% if message['role'] == 'user' %}[INST]{% for item in message['content'] %}{% if item['type'] == 'image' %}[IMG]{% else %}{{ item['text'] }}{% endif %}{% endfor %}[/INST]{% elif message['role'] == 'assistant' %}{{ message['content'][0]['text'] }}{{ eos_token }}{% endif %}{% endfor %}";

const FLORENCE2_TEMPLATE: &str = "{% for message in messages %}{% if message['role'] == 'user' %}{% for item in message['content'] %}{% if item['type'] == 'image' %}<image>{% else %}{{ item['text'] }}{% endif %}{% endfor %}{% endif %}{% endfor %}";

const MOLMO_TEMPLATE: &str = "{% for message in messages %}{% if message['role'] == 'user' %} User: {% for item in message['content'] %}{% if item['type'] == 'image' %}<im_patch>{% else %}{{ item['text'] }}{% endif %}{% endfor %}{% elif message['role'] == 'assistant' %} Assistant: {{ message['content'][0]['text'] }}{% endif %}{% endfor %}{% if add_generation_prompt %} Assistant:{% endif %}";

const GEMMA3_TEMPLATE: &str = "{{ bos_token }}{% for message in messages %}<start_of_turn>{% if message['role'] == 'assistant' %}model{% else %}{{ message['role'] }}{% endif %}\n{% for item in message['content'] %}{% if item['type'] == 'image' %}\n\n<start_of_image><image_soft_token><end_of_image>\n\n{% else %}{{ item['text'] }}{% endif %}{% endfor %}<end_of_turn>\n{% endfor %}{% if add_generation_prompt %}<start_of_turn>model\n{% endif %}";

const JANUS_TEMPLATE: &str = "{% for message in messages %}{% if message['role'] == 'system' %}{{ message['content'][0]['text'] }}\n\n{% else %}<|{{ message['role'] | capitalize }}|>: {% for item in message['content'] %}{% if item['type'] == 'image' %}<begin_of_image><image_placeholder><end_of_image>\n{% else %}{{ item['text'] }}{% endif %}{% endfor %}\n\n{% endif %}{% endfor %}{% if add_generation_prompt %}<|Assistant|>:{% endif %}";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(config: Value) -> RawMetadata {
        RawMetadata {
            config,
            ..Default::default()
        }
    }

    #[test]
    fn test_every_family_has_a_row() {
        let families: Vec<_> = ArchitectureFamily::all().collect();
        assert_eq!(families.len(), ARCHITECTURES.len());
        for family in families {
            assert_eq!(spec_for(family).family, family);
            assert_eq!(lookup(family.as_str()).unwrap(), family);
            assert!(!defaults(family).chat_template.is_empty());
        }
    }

    #[test]
    fn test_lookup_normalizes_case_and_dashes() {
        assert_eq!(lookup("Qwen2-VL").unwrap(), ArchitectureFamily::Qwen2Vl);
        assert_eq!(lookup("bunny_llama").unwrap(), ArchitectureFamily::BunnyLlama);
        assert!(matches!(lookup("gpt2"), Err(VlmError::UnknownArchitecture(_))));
    }

    #[test]
    fn test_unknown_model_type_fails() {
        let err = resolve_metadata(&raw(json!({"model_type": "not-a-vlm"}))).unwrap_err();
        assert!(matches!(err, VlmError::UnknownArchitecture(ref name) if name == "not-a-vlm"));

        let err = resolve_metadata(&raw(json!({"architectures": ["FooForCausalLM"]}))).unwrap_err();
        assert!(matches!(err, VlmError::UnknownArchitecture(ref name) if name == "FooForCausalLM"));
    }

    #[test]
    fn test_falls_back_to_hf_architecture() {
        let config = resolve_metadata(&raw(json!({
            "architectures": ["Qwen2VLForConditionalGeneration"]
        })))
        .unwrap();
        assert_eq!(config.family, ArchitectureFamily::Qwen2Vl);
        assert!(config.supports_video());
    }

    #[test]
    fn test_metadata_overrides_table_defaults() {
        let metadata = RawMetadata {
            config: json!({
                "model_type": "llava",
                "image_token_index": 32000,
                "text_config": {"max_position_embeddings": 2048, "eos_token_id": [2, 7]},
                "vision_config": {"patch_size": 14},
                "tie_word_embeddings": false
            }),
            preprocessor: Some(json!({
                "image_mean": [0.1, 0.2, 0.3],
                "image_std": [0.4, 0.5, 0.6],
                "size": {"height": 224, "width": 224}
            })),
            tokenizer: Some(json!({
                "bos_token": {"content": "<s>"},
                "eos_token": "<|eot|>",
                "chat_template": "{{ messages }}"
            })),
            ..Default::default()
        };
        let config = resolve_metadata(&metadata).unwrap();

        assert_eq!(config.image_token_id, Some(TokenId(32000)));
        assert_eq!(config.context_length, 2048);
        assert_eq!(config.eos_token_ids, vec![TokenId(2), TokenId(7)]);
        assert_eq!(config.eos_tokens[0], "<|eot|>");
        assert_eq!(config.chat_template, "{{ messages }}");
        assert_eq!(config.image.mean, [0.1, 0.2, 0.3]);
        assert_eq!(config.image.resize, ResizePolicy::Fixed { width: 224, height: 224 });
        assert_eq!(config.get::<bool>("tie_word_embeddings"), Some(false));
        assert_eq!(config.image_tokens, VisionTokenFormula::Fixed(576));
    }

    #[test]
    fn test_qwen_pixel_window_from_preprocessor() {
        let metadata = RawMetadata {
            config: json!({"model_type": "qwen2_5_vl"}),
            preprocessor: Some(json!({"min_pixels": 3136, "max_pixels": 200704})),
            ..Default::default()
        };
        let config = resolve_metadata(&metadata).unwrap();
        assert_eq!(
            config.image.resize,
            ResizePolicy::Smart {
                factor: 28,
                min_pixels: 3136,
                max_pixels: 200_704
            }
        );
    }

    #[test]
    fn test_zero_patch_size_rejected() {
        let err = resolve_metadata(&raw(json!({
            "model_type": "qwen2_vl",
            "image_token_id": 151655,
            "vision_config": {"patch_size": 0}
        })))
        .unwrap_err();
        assert!(matches!(err, VlmError::InvalidConfig(_)));

        let err = resolve_metadata(&RawMetadata {
            config: json!({"model_type": "pixtral"}),
            preprocessor: Some(json!({"size": {"longest_edge": 0}})),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, VlmError::InvalidConfig(_)));
    }

    #[test]
    fn test_table_defaults_are_valid() {
        for family in ArchitectureFamily::all() {
            defaults(family).validate().unwrap();
        }
    }

    #[test]
    fn test_phi4mm_builtin_adapters() {
        let config = resolve_metadata(&raw(json!({
            "model_type": "phi4mm",
            "vision_lora": {
                "dp": 0.0,
                "layer": r"layers.*((self_attn\.(qkv_proj|o_proj))|(mlp\.(gate_up|down)_proj))",
                "lora_alpha": 512,
                "r": 256
            },
            "speech_lora": {
                "dp": 0.01,
                "layer": r"((layers.*self_attn\.(qkv|o)_proj)|(layers.*mlp\.(gate_up|down)_proj))",
                "lora_alpha": 640,
                "r": 320
            }
        })))
        .unwrap();

        let vision = config.builtin_adapter(InputMode::Vision).unwrap();
        assert_eq!(vision.name, "vision");
        assert_eq!(vision.config.rank, 256);
        assert_eq!(vision.config.scale(), 2.0);
        assert!(vision.config.targets.matches("model.layers.3.self_attn.o_proj"));
        assert!(vision.config.targets.matches("layers.0.mlp.down_proj"));
        assert!(!vision.config.targets.matches("model.layers.3.self_attn.k_proj"));

        let speech = config.builtin_adapter(InputMode::Speech).unwrap();
        assert_eq!(speech.config.rank, 320);

        let plain = defaults(ArchitectureFamily::Phi4Mm);
        assert!(plain.builtin_adapters.is_empty());
    }

    #[test]
    fn test_pixtral_break_token() {
        let config = resolve_metadata(&raw(json!({
            "model_type": "pixtral",
            "image_token_index": 10,
            "image_break_token_id": 12
        })))
        .unwrap();
        assert_eq!(config.image_break_token.as_deref(), Some("[IMG_BREAK]"));
        assert_eq!(config.image_break_token_id, Some(TokenId(12)));
        assert!(defaults(ArchitectureFamily::Llava).image_break_token.is_none());
    }
}
