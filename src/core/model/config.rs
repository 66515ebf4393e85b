use super::registry::ArchitectureFamily;
use super::TokenId;
use crate::core::{Result, VlmError};
use crate::lora::AdapterConfig;
use crate::media::{MediaItem, MediaKind};
use serde::Serialize;
use std::collections::HashMap;

pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];
pub const HALF_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const HALF_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Where placeholder runs go relative to the user text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderPlacement {
    BeforeText,
    AfterText,
    Inline,
}

/// How several media items are laid out against each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaLayout {
    Grouped,
    Interleaved { separator: String },
}

/// Number of vision tokens an image of a given (already resized) size yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionTokenFormula {
    Fixed(usize),
    /// Patch grid merged `merge_size`×`merge_size`.
    Patches { patch_size: usize, merge_size: usize },
    /// Patch grid plus one row-break token per row.
    PatchRows { patch_size: usize },
    /// One block per tile, plus a global view when more than one tile.
    Tiled { tile_size: usize, tokens_per_tile: usize },
}

impl VisionTokenFormula {
    pub fn count(&self, width: usize, height: usize) -> usize {
        match *self {
            VisionTokenFormula::Fixed(n) => n,
            VisionTokenFormula::Patches { patch_size, merge_size } => {
                let unit = patch_size * merge_size;
                (height / unit) * (width / unit)
            }
            VisionTokenFormula::PatchRows { patch_size } => {
                let rows = height / patch_size;
                let cols = width / patch_size;
                rows * (cols + 1)
            }
            VisionTokenFormula::Tiled { tile_size, tokens_per_tile } => {
                let tiles = width.div_ceil(tile_size) * height.div_ceil(tile_size);
                if tiles > 1 {
                    (tiles + 1) * tokens_per_tile
                } else {
                    tokens_per_tile
                }
            }
        }
    }

    /// `(rows, cols)` of the patch grid for formulas that break rows.
    pub fn row_grid(&self, width: usize, height: usize) -> Option<(usize, usize)> {
        match *self {
            VisionTokenFormula::PatchRows { patch_size } => Some((height / patch_size, width / patch_size)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let zero = match *self {
            VisionTokenFormula::Fixed(_) => None,
            VisionTokenFormula::Patches { patch_size, merge_size } => {
                (patch_size == 0 || merge_size == 0).then_some("patch_size/merge_size")
            }
            VisionTokenFormula::PatchRows { patch_size } => (patch_size == 0).then_some("patch_size"),
            VisionTokenFormula::Tiled { tile_size, .. } => (tile_size == 0).then_some("tile_size"),
        };
        match zero {
            Some(field) => Err(VlmError::InvalidConfig(format!("{} must be non-zero in {:?}", field, self))),
            None => Ok(()),
        }
    }

    /// Side length that frame sizes must be a multiple of for the count to be exact.
    pub fn spatial_factor(&self) -> usize {
        match *self {
            VisionTokenFormula::Fixed(_) => 1,
            VisionTokenFormula::Patches { patch_size, merge_size } => patch_size * merge_size,
            VisionTokenFormula::PatchRows { patch_size } => patch_size,
            VisionTokenFormula::Tiled { tile_size, .. } => tile_size,
        }
    }

    fn with_patch_size(self, patch: usize) -> Self {
        match self {
            VisionTokenFormula::Patches { merge_size, .. } => VisionTokenFormula::Patches {
                patch_size: patch,
                merge_size,
            },
            VisionTokenFormula::PatchRows { .. } => VisionTokenFormula::PatchRows { patch_size: patch },
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoTokenFormula {
    pub per_frame: VisionTokenFormula,
    pub temporal_patch_size: usize,
}

impl VideoTokenFormula {
    pub fn count(&self, frames: usize, width: usize, height: usize) -> usize {
        frames.div_ceil(self.temporal_patch_size.max(1)) * self.per_frame.count(width, height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizePolicy {
    Fixed { width: usize, height: usize },
    /// Downscale so the longest side fits `edge`, then round each side up to `multiple`.
    LongestEdge { edge: usize, multiple: usize },
    /// Round to `factor` and rescale into `[min_pixels, max_pixels]`.
    Smart {
        factor: usize,
        min_pixels: usize,
        max_pixels: usize,
    },
}

impl ResizePolicy {
    pub fn target_size(&self, width: usize, height: usize) -> (usize, usize) {
        match *self {
            ResizePolicy::Fixed { width, height } => (width, height),
            ResizePolicy::LongestEdge { edge, multiple } => {
                let longest = width.max(height).max(1);
                let scale = if longest > edge { edge as f64 / longest as f64 } else { 1.0 };
                let fit = |side: usize| {
                    let scaled = ((side as f64 * scale).round() as usize).max(1);
                    scaled.div_ceil(multiple) * multiple
                };
                (fit(width), fit(height))
            }
            ResizePolicy::Smart {
                factor,
                min_pixels,
                max_pixels,
            } => smart_resize(width, height, factor, min_pixels, max_pixels),
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, ResizePolicy::Fixed { .. })
    }

    pub fn validate(&self) -> Result<()> {
        let valid = match *self {
            ResizePolicy::Fixed { width, height } => width > 0 && height > 0,
            ResizePolicy::LongestEdge { edge, multiple } => edge > 0 && multiple > 0,
            ResizePolicy::Smart {
                factor,
                min_pixels,
                max_pixels,
            } => factor > 0 && max_pixels > 0 && min_pixels <= max_pixels,
        };
        if valid {
            Ok(())
        } else {
            Err(VlmError::InvalidConfig(format!("degenerate resize policy {:?}", self)))
        }
    }
}

fn smart_resize(width: usize, height: usize, factor: usize, min_pixels: usize, max_pixels: usize) -> (usize, usize) {
    let f = factor as f64;
    let (w, h) = (width.max(1) as f64, height.max(1) as f64);
    let mut h_bar = ((h / f).round() * f).max(f);
    let mut w_bar = ((w / f).round() * f).max(f);

    if h_bar * w_bar > max_pixels as f64 {
        let beta = (h * w / max_pixels as f64).sqrt();
        h_bar = ((h / beta / f).floor() * f).max(f);
        w_bar = ((w / beta / f).floor() * f).max(f);
    } else if h_bar * w_bar < min_pixels as f64 {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = (h * beta / f).ceil() * f;
        w_bar = (w * beta / f).ceil() * f;
    }

    (w_bar as usize, h_bar as usize)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagePreprocessing {
    pub resize: ResizePolicy,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub rescale_factor: f32,
    /// Hard bound on decoded source pixels, checked before resizing.
    pub max_source_pixels: usize,
}

impl Default for ImagePreprocessing {
    fn default() -> Self {
        Self {
            resize: ResizePolicy::Fixed { width: 336, height: 336 },
            mean: CLIP_MEAN,
            std: CLIP_STD,
            rescale_factor: 1.0 / 255.0,
            max_source_pixels: 8192 * 8192,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoPreprocessing {
    pub default_fps: f64,
    pub max_frames: usize,
    pub max_total_pixels: usize,
}

impl Default for VideoPreprocessing {
    fn default() -> Self {
        Self {
            default_fps: 1.0,
            max_frames: 64,
            max_total_pixels: 64 * 448 * 448,
        }
    }
}

/// Everything the pipeline needs to know about a model, resolved once and
/// shared read-only by every component.
#[derive(Debug, Clone, Serialize)]
pub struct ModelConfig {
    pub family: ArchitectureFamily,
    pub model_type: String,
    pub image_token: String,
    pub image_token_id: Option<TokenId>,
    /// Closes each patch row of a `PatchRows` image.
    pub image_break_token: Option<String>,
    pub image_break_token_id: Option<TokenId>,
    pub video_token: Option<String>,
    pub video_token_id: Option<TokenId>,
    pub placement: PlaceholderPlacement,
    pub layout: MediaLayout,
    pub image_tokens: VisionTokenFormula,
    pub video_tokens: Option<VideoTokenFormula>,
    pub image: ImagePreprocessing,
    pub video: VideoPreprocessing,
    pub chat_template: String,
    pub bos_token: Option<String>,
    pub eos_tokens: Vec<String>,
    pub eos_token_ids: Vec<TokenId>,
    pub context_length: usize,
    /// Named adapters the model activates by itself based on the request's input mode.
    pub builtin_adapters: Vec<BuiltinAdapter>,
    pub custom: HashMap<String, ConfigValue>,
}

impl ModelConfig {
    pub fn builder(family: ArchitectureFamily) -> ModelConfigBuilder {
        ModelConfigBuilder::new(family)
    }

    pub fn supports_video(&self) -> bool {
        self.video_tokens.is_some() && self.video_token.is_some()
    }

    pub fn marker(&self, kind: MediaKind) -> Option<&str> {
        match kind {
            MediaKind::Image => Some(self.image_token.as_str()),
            MediaKind::Video => self.video_token.as_deref(),
        }
    }

    /// Vision tokens a preprocessed item will occupy in the sequence.
    pub fn vision_token_count(&self, item: &MediaItem) -> Result<usize> {
        let (width, height) = item.spatial_size();
        match item.kind() {
            MediaKind::Image => Ok(self.image_tokens.count(width, height)),
            MediaKind::Video => self
                .video_tokens
                .map(|formula| formula.count(item.frame_count(), width, height))
                .ok_or_else(|| VlmError::UnsupportedMedia(format!("{} does not accept video", self.model_type))),
        }
    }

    pub fn get<T: FromConfigValue>(&self, key: &str) -> Option<T> {
        self.custom.get(key).and_then(|v| T::from_config_value(v.clone()))
    }

    /// Rejects values that would make token counts or resizing meaningless.
    pub fn validate(&self) -> Result<()> {
        self.image_tokens.validate()?;
        if let Some(video) = &self.video_tokens {
            video.per_frame.validate()?;
            if video.temporal_patch_size == 0 {
                return Err(VlmError::InvalidConfig("temporal_patch_size must be non-zero".to_string()));
            }
        }
        self.image.resize.validate()?;
        if self.context_length == 0 {
            return Err(VlmError::InvalidConfig("context length must be non-zero".to_string()));
        }
        Ok(())
    }

    /// The built-in adapter for `mode`, if the model declares one.
    pub fn builtin_adapter(&self, mode: InputMode) -> Option<&BuiltinAdapter> {
        self.builtin_adapters.iter().find(|a| a.mode == mode)
    }
}

/// What kind of input a request carries, for models that switch adapters on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    Vision,
    Speech,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuiltinAdapter {
    pub name: String,
    pub mode: InputMode,
    #[serde(skip)]
    pub config: AdapterConfig,
}

pub struct ModelConfigBuilder {
    config: ModelConfig,
}

impl ModelConfigBuilder {
    pub fn new(family: ArchitectureFamily) -> Self {
        Self {
            config: ModelConfig {
                family,
                model_type: family.as_str().to_string(),
                image_token: "<image>".to_string(),
                image_token_id: None,
                image_break_token: None,
                image_break_token_id: None,
                video_token: None,
                video_token_id: None,
                placement: PlaceholderPlacement::BeforeText,
                layout: MediaLayout::Grouped,
                image_tokens: VisionTokenFormula::Fixed(576),
                video_tokens: None,
                image: ImagePreprocessing::default(),
                video: VideoPreprocessing::default(),
                chat_template: String::new(),
                bos_token: None,
                eos_tokens: Vec::new(),
                eos_token_ids: Vec::new(),
                context_length: 4096,
                builtin_adapters: Vec::new(),
                custom: HashMap::new(),
            },
        }
    }

    pub fn model_type(mut self, model_type: impl Into<String>) -> Self {
        self.config.model_type = model_type.into();
        self
    }

    pub fn image_token(mut self, token: impl Into<String>) -> Self {
        self.config.image_token = token.into();
        self
    }

    pub fn image_token_id(mut self, id: TokenId) -> Self {
        self.config.image_token_id = Some(id);
        self
    }

    pub fn image_break_token(mut self, token: impl Into<String>) -> Self {
        self.config.image_break_token = Some(token.into());
        self
    }

    pub fn image_break_token_id(mut self, id: TokenId) -> Self {
        self.config.image_break_token_id = Some(id);
        self
    }

    pub fn video_token(mut self, token: impl Into<String>) -> Self {
        self.config.video_token = Some(token.into());
        self
    }

    pub fn video_token_id(mut self, id: TokenId) -> Self {
        self.config.video_token_id = Some(id);
        self
    }

    pub fn placement(mut self, placement: PlaceholderPlacement) -> Self {
        self.config.placement = placement;
        self
    }

    pub fn layout(mut self, layout: MediaLayout) -> Self {
        self.config.layout = layout;
        self
    }

    pub fn image_tokens(mut self, formula: VisionTokenFormula) -> Self {
        self.config.image_tokens = formula;
        self
    }

    pub fn video_tokens(mut self, formula: VideoTokenFormula) -> Self {
        self.config.video_tokens = Some(formula);
        self
    }

    pub fn patch_size(mut self, patch: usize) -> Self {
        self.config.image_tokens = self.config.image_tokens.with_patch_size(patch);
        if let Some(video) = self.config.video_tokens.as_mut() {
            video.per_frame = video.per_frame.with_patch_size(patch);
        }
        self
    }

    pub fn resize(mut self, policy: ResizePolicy) -> Self {
        self.config.image.resize = policy;
        self
    }

    pub fn normalize(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.config.image.mean = mean;
        self.config.image.std = std;
        self
    }

    pub fn rescale_factor(mut self, factor: f32) -> Self {
        self.config.image.rescale_factor = factor;
        self
    }

    pub fn max_source_pixels(mut self, pixels: usize) -> Self {
        self.config.image.max_source_pixels = pixels;
        self
    }

    pub fn video(mut self, video: VideoPreprocessing) -> Self {
        self.config.video = video;
        self
    }

    pub fn chat_template(mut self, template: impl Into<String>) -> Self {
        self.config.chat_template = template.into();
        self
    }

    pub fn bos_token(mut self, token: impl Into<String>) -> Self {
        self.config.bos_token = Some(token.into());
        self
    }

    pub fn eos_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.eos_tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn eos_token_ids(mut self, ids: Vec<TokenId>) -> Self {
        self.config.eos_token_ids = ids;
        self
    }

    pub fn context_length(mut self, len: usize) -> Self {
        self.config.context_length = len;
        self
    }

    pub fn builtin_adapter(mut self, adapter: BuiltinAdapter) -> Self {
        self.config.builtin_adapters.retain(|a| a.mode != adapter.mode);
        self.config.builtin_adapters.push(adapter);
        self
    }

    pub fn custom<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: IntoConfigValue,
    {
        self.config.custom.insert(key.into(), value.into_config_value());
        self
    }

    pub fn build(self) -> ModelConfig {
        self.config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bool(bool),
    Array(Vec<ConfigValue>),
}

impl ConfigValue {
    /// Scalars and arrays of scalars; objects and nulls have no representation.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Bool(b) => Some(ConfigValue::Bool(*b)),
            Value::Number(n) => n
                .as_u64()
                .map(ConfigValue::Uint)
                .or_else(|| n.as_i64().map(ConfigValue::Int))
                .or_else(|| n.as_f64().map(ConfigValue::Float)),
            Value::String(s) => Some(ConfigValue::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(ConfigValue::from_json)
                .collect::<Option<Vec<_>>>()
                .map(ConfigValue::Array),
            Value::Object(_) | Value::Null => None,
        }
    }
}

pub trait FromConfigValue: Sized {
    fn from_config_value(value: ConfigValue) -> Option<Self>;
}

impl FromConfigValue for i64 {
    fn from_config_value(value: ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Int(v) => Some(v),
            ConfigValue::Uint(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }
}

impl FromConfigValue for u64 {
    fn from_config_value(value: ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Uint(v) => Some(v),
            ConfigValue::Int(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }
}

impl FromConfigValue for f64 {
    fn from_config_value(value: ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Float(v) => Some(v),
            ConfigValue::Int(v) => Some(v as f64),
            ConfigValue::Uint(v) => Some(v as f64),
            _ => None,
        }
    }
}

impl FromConfigValue for String {
    fn from_config_value(value: ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl FromConfigValue for bool {
    fn from_config_value(value: ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Bool(v) => Some(v),
            ConfigValue::Int(v) => Some(v != 0),
            ConfigValue::Uint(v) => Some(v != 0),
            _ => None,
        }
    }
}

pub trait IntoConfigValue {
    fn into_config_value(self) -> ConfigValue;
}

impl IntoConfigValue for i64 {
    fn into_config_value(self) -> ConfigValue {
        ConfigValue::Int(self)
    }
}

impl IntoConfigValue for u64 {
    fn into_config_value(self) -> ConfigValue {
        ConfigValue::Uint(self)
    }
}

impl IntoConfigValue for f64 {
    fn into_config_value(self) -> ConfigValue {
        ConfigValue::Float(self)
    }
}

impl IntoConfigValue for String {
    fn into_config_value(self) -> ConfigValue {
        ConfigValue::String(self)
    }
}

impl IntoConfigValue for &str {
    fn into_config_value(self) -> ConfigValue {
        ConfigValue::String(self.to_string())
    }
}

impl IntoConfigValue for bool {
    fn into_config_value(self) -> ConfigValue {
        ConfigValue::Bool(self)
    }
}

impl IntoConfigValue for ConfigValue {
    fn into_config_value(self) -> ConfigValue {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ModelConfig::builder(ArchitectureFamily::Qwen2Vl)
            .image_token("<|image_pad|>")
            .image_tokens(VisionTokenFormula::Patches {
                patch_size: 16,
                merge_size: 2,
            })
            .patch_size(14)
            .context_length(8192)
            .custom("sliding_window", 4096u64)
            .build();

        assert_eq!(config.model_type, "qwen2_vl");
        assert_eq!(config.context_length, 8192);
        assert_eq!(
            config.image_tokens,
            VisionTokenFormula::Patches {
                patch_size: 14,
                merge_size: 2
            }
        );
        assert_eq!(config.get::<u64>("sliding_window"), Some(4096));
        assert!(!config.supports_video());
    }

    #[test]
    fn test_token_formulas() {
        assert_eq!(VisionTokenFormula::Fixed(576).count(10, 10), 576);

        let qwen = VisionTokenFormula::Patches {
            patch_size: 14,
            merge_size: 2,
        };
        assert_eq!(qwen.count(448, 448), 256);
        assert_eq!(qwen.count(224, 224), 64);

        let pixtral = VisionTokenFormula::PatchRows { patch_size: 16 };
        assert_eq!(pixtral.count(64, 32), 2 * 5);

        let tiled = VisionTokenFormula::Tiled {
            tile_size: 364,
            tokens_per_tile: 169,
        };
        assert_eq!(tiled.count(364, 364), 169);
        assert_eq!(tiled.count(728, 364), 3 * 169);

        let video = VideoTokenFormula {
            per_frame: qwen,
            temporal_patch_size: 2,
        };
        assert_eq!(video.count(10, 224, 224), 5 * 64);
        assert_eq!(video.count(3, 224, 224), 2 * 64);
    }

    #[test]
    fn test_smart_resize_respects_window() {
        let policy = ResizePolicy::Smart {
            factor: 28,
            min_pixels: 56 * 56,
            max_pixels: 28 * 28 * 256,
        };

        let (w, h) = policy.target_size(1920, 1080);
        assert_eq!(w % 28, 0);
        assert_eq!(h % 28, 0);
        assert!(w * h <= 28 * 28 * 256);

        let (w, h) = policy.target_size(20, 20);
        assert!(w * h >= 56 * 56);
        assert_eq!((w % 28, h % 28), (0, 0));

        assert_eq!(policy.target_size(224, 224), (224, 224));
    }

    #[test]
    fn test_longest_edge_downscales_only() {
        let policy = ResizePolicy::LongestEdge {
            edge: 1024,
            multiple: 16,
        };
        assert_eq!(policy.target_size(2048, 1024), (1024, 512));
        assert_eq!(policy.target_size(100, 50), (112, 64));
    }

    #[test]
    fn test_config_value_from_json() {
        let value = serde_json::json!([1, 2, 3]);
        assert_eq!(
            ConfigValue::from_json(&value),
            Some(ConfigValue::Array(vec![
                ConfigValue::Uint(1),
                ConfigValue::Uint(2),
                ConfigValue::Uint(3)
            ]))
        );
        assert_eq!(ConfigValue::from_json(&serde_json::json!({"a": 1})), None);
        assert_eq!(
            f64::from_config_value(ConfigValue::from_json(&serde_json::json!(0.5)).unwrap()),
            Some(0.5)
        );
    }
}
