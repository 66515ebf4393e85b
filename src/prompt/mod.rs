//! Builds the token sequence for a prompt with media: renders the chat
//! template, then expands every media marker into the exact number of
//! placeholder tokens the vision encoder will fill.

use crate::core::model::{MediaLayout, PlaceholderPlacement, VisionTokenFormula};
use crate::core::{ModelConfig, Result, TokenId, Tokenizer, VlmError};
use crate::media::{MediaItem, MediaKind};
use crate::template::{ChatTemplate, Line, Message, Role};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct PromptSpec<'a> {
    pub text: &'a str,
    pub system: Option<&'a str>,
    pub media: &'a [MediaItem],
}

impl<'a> PromptSpec<'a> {
    pub fn new(text: &'a str, media: &'a [MediaItem]) -> Self {
        Self {
            text,
            system: None,
            media,
        }
    }

    pub fn with_system(mut self, system: &'a str) -> Self {
        self.system = Some(system);
        self
    }
}

/// A contiguous run of placeholder tokens owned by one media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaceholderSpan {
    pub media_index: usize,
    pub start: usize,
    pub len: usize,
    #[serde(serialize_with = "serialize_kind")]
    pub kind: MediaKind,
}

impl PlaceholderSpan {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

fn serialize_kind<S: serde::Serializer>(kind: &MediaKind, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(match kind {
        MediaKind::Image => "image",
        MediaKind::Video => "video",
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposedSequence {
    /// Rendered template text, markers unexpanded.
    pub prompt: String,
    pub tokens: Vec<TokenId>,
    /// One span per media item, in media order.
    pub spans: Vec<PlaceholderSpan>,
}

impl ComposedSequence {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn placeholder_count(&self) -> usize {
        self.spans.iter().map(|s| s.len).sum()
    }
}

pub fn compose(spec: &PromptSpec<'_>, config: &ModelConfig, tokenizer: &dyn Tokenizer) -> Result<ComposedSequence> {
    let content = build_content(spec, config)?;

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = spec.system {
        messages.push(Message::system(system));
    }
    messages.push(Message::new(Role::User, content));

    let template = ChatTemplate::new(config.chat_template.as_str())?;
    let prompt = template.render(
        &messages,
        true,
        config.bos_token.as_deref(),
        config.eos_tokens.first().map(String::as_str),
    )?;

    let (tokens, spans) = expand_markers(&prompt, spec.media, config, tokenizer)?;
    debug!(
        tokens = tokens.len(),
        media = spans.len(),
        placeholders = spans.iter().map(|s| s.len).sum::<usize>(),
        "composed prompt"
    );

    Ok(ComposedSequence { prompt, tokens, spans })
}

fn marker_for(config: &ModelConfig, kind: MediaKind) -> Result<&str> {
    config
        .marker(kind)
        .ok_or_else(|| VlmError::UnsupportedMedia(format!("{} does not accept {:?}", config.model_type, kind)))
}

fn media_line(kind: MediaKind) -> Line {
    match kind {
        MediaKind::Image => Line::Image,
        MediaKind::Video => Line::Video,
    }
}

/// User message content with media laid out per the family's placement.
fn build_content(spec: &PromptSpec<'_>, config: &ModelConfig) -> Result<Vec<Line>> {
    for item in spec.media {
        marker_for(config, item.kind())?;
    }
    if let Some((_, kind, marker)) = spec.system.and_then(|system| find_markers(system, config).into_iter().next()) {
        return Err(VlmError::InvalidPrompt(format!(
            "system prompt contains the reserved {:?} marker {}",
            kind, marker
        )));
    }

    let markers = find_markers(spec.text, config);
    if config.placement == PlaceholderPlacement::Inline && !markers.is_empty() {
        return inline_content(spec, config, &markers);
    }
    if let Some((_, kind, marker)) = markers.first() {
        return Err(VlmError::InvalidPrompt(format!(
            "prompt text contains the reserved {:?} marker {}",
            kind, marker
        )));
    }

    let separator = match &config.layout {
        MediaLayout::Interleaved { separator } => Some(separator.as_str()),
        MediaLayout::Grouped => None,
    };
    let mut media_lines = Vec::new();
    for item in spec.media {
        media_lines.push(media_line(item.kind()));
        if let Some(separator) = separator {
            media_lines.push(Line::text(separator));
        }
    }

    let text = (!spec.text.is_empty()).then(|| Line::text(spec.text));
    let content = match config.placement {
        PlaceholderPlacement::AfterText => text.into_iter().chain(media_lines).collect(),
        PlaceholderPlacement::BeforeText | PlaceholderPlacement::Inline => {
            media_lines.into_iter().chain(text).collect()
        }
    };
    Ok(content)
}

fn inline_content(spec: &PromptSpec<'_>, config: &ModelConfig, markers: &[(usize, MediaKind, String)]) -> Result<Vec<Line>> {
    if markers.len() != spec.media.len() {
        return Err(VlmError::InvalidPrompt(format!(
            "prompt has {} media markers but {} media items were given",
            markers.len(),
            spec.media.len()
        )));
    }

    let mut content = Vec::new();
    let mut cursor = 0;
    for ((position, kind, marker), item) in markers.iter().zip(spec.media) {
        if *kind != item.kind() {
            return Err(VlmError::InvalidPrompt(format!(
                "marker {} at byte {} does not match media item of kind {:?}",
                marker,
                position,
                item.kind()
            )));
        }
        let before = &spec.text[cursor..*position];
        if !before.is_empty() {
            content.push(Line::text(before));
        }
        content.push(media_line(*kind));
        cursor = position + marker.len();
    }
    let rest = &spec.text[cursor..];
    if !rest.is_empty() {
        content.push(Line::text(rest));
    }

    debug!(family = %config.family, markers = markers.len(), "inline media placement");
    Ok(content)
}

/// Every image or video marker occurrence in `text`, by byte position.
fn find_markers(text: &str, config: &ModelConfig) -> Vec<(usize, MediaKind, String)> {
    let mut found = Vec::new();
    for kind in [MediaKind::Image, MediaKind::Video] {
        if let Some(marker) = config.marker(kind) {
            found.extend(
                text.match_indices(marker)
                    .map(|(position, m)| (position, kind, m.to_string())),
            );
        }
    }
    found.sort_by_key(|(position, _, _)| *position);
    found
}

fn placeholder_id(config: &ModelConfig, kind: MediaKind, tokenizer: &dyn Tokenizer) -> Result<TokenId> {
    let configured = match kind {
        MediaKind::Image => config.image_token_id,
        MediaKind::Video => config.video_token_id,
    };
    if let Some(id) = configured {
        return Ok(id);
    }

    let marker = marker_for(config, kind)?;
    tokenizer
        .token_to_id(marker)
        .ok_or_else(|| VlmError::InvalidConfig(format!("tokenizer has no id for placeholder {}", marker)))
}

/// Id of the row-break token, when the image formula breaks rows and the
/// family names one.
fn row_break_id(config: &ModelConfig, tokenizer: &dyn Tokenizer) -> Result<Option<TokenId>> {
    if !matches!(config.image_tokens, VisionTokenFormula::PatchRows { .. }) {
        return Ok(None);
    }
    if let Some(id) = config.image_break_token_id {
        return Ok(Some(id));
    }
    match config.image_break_token.as_deref() {
        Some(token) => tokenizer
            .token_to_id(token)
            .map(Some)
            .ok_or_else(|| VlmError::InvalidConfig(format!("tokenizer has no id for row break {}", token))),
        None => Ok(None),
    }
}

/// Placeholder ids for one item. Row-broken images end every patch row with
/// the break id, which keeps the run length equal to the formula count.
fn placeholder_run(item: &MediaItem, len: usize, id: TokenId, break_id: Option<TokenId>, config: &ModelConfig) -> Vec<TokenId> {
    let (width, height) = item.spatial_size();
    match (item.kind(), break_id, config.image_tokens.row_grid(width, height)) {
        (MediaKind::Image, Some(break_id), Some((rows, cols))) => {
            let mut run = Vec::with_capacity(len);
            for _ in 0..rows {
                run.extend(std::iter::repeat(id).take(cols));
                run.push(break_id);
            }
            run
        }
        _ => vec![id; len],
    }
}

fn expand_markers(
    prompt: &str,
    media: &[MediaItem],
    config: &ModelConfig,
    tokenizer: &dyn Tokenizer,
) -> Result<(Vec<TokenId>, Vec<PlaceholderSpan>)> {
    let markers = find_markers(prompt, config);
    if markers.len() != media.len() {
        return Err(VlmError::PlaceholderMismatch {
            expected: media.len(),
            actual: markers.len(),
        });
    }

    let image_id = media
        .iter()
        .any(|m| m.kind() == MediaKind::Image)
        .then(|| placeholder_id(config, MediaKind::Image, tokenizer))
        .transpose()?;
    let video_id = media
        .iter()
        .any(|m| m.kind() == MediaKind::Video)
        .then(|| placeholder_id(config, MediaKind::Video, tokenizer))
        .transpose()?;
    let break_id = match image_id {
        Some(_) => row_break_id(config, tokenizer)?,
        None => None,
    };

    let mut tokens = Vec::new();
    let mut spans = Vec::with_capacity(media.len());
    let mut expected = 0;
    let mut cursor = 0;

    for (media_index, ((position, kind, marker), item)) in markers.iter().zip(media).enumerate() {
        if *kind != item.kind() {
            return Err(VlmError::PlaceholderMismatch {
                expected: media.len(),
                actual: media_index,
            });
        }
        tokens.extend(tokenizer.encode(&prompt[cursor..*position])?);

        let len = config.vision_token_count(item)?;
        let id = match kind {
            MediaKind::Image => image_id,
            MediaKind::Video => video_id,
        }
        .ok_or_else(|| VlmError::InvalidConfig(format!("no placeholder id for {:?}", kind)))?;

        spans.push(PlaceholderSpan {
            media_index,
            start: tokens.len(),
            len,
            kind: *kind,
        });
        tokens.extend(placeholder_run(item, len, id, break_id, config));
        expected += len;
        cursor = position + marker.len();
    }
    tokens.extend(tokenizer.encode(&prompt[cursor..])?);

    let actual = tokens
        .iter()
        .filter(|t| Some(**t) == image_id || Some(**t) == video_id || Some(**t) == break_id)
        .count();
    if actual != expected {
        return Err(VlmError::PlaceholderMismatch { expected, actual });
    }

    Ok((tokens, spans))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{registry, ArchitectureFamily};
    use crate::testing::{self, WordTokenizer};

    #[test]
    fn test_one_image_expands_to_formula_count() {
        let config = registry::defaults(ArchitectureFamily::Llava);
        let tokenizer = testing::tokenizer();
        let media = vec![testing::image_item(336, 336)];

        let composed = compose(&PromptSpec::new("describe the image", &media), &config, &tokenizer).unwrap();
        assert_eq!(composed.spans.len(), 1);
        assert_eq!(composed.spans[0].len, 576);
        assert_eq!(composed.placeholder_count(), 576);

        let image_id = tokenizer.token_to_id("<image>").unwrap();
        let count = composed.tokens.iter().filter(|t| **t == image_id).count();
        assert_eq!(count, 576);
        assert!(composed.prompt.starts_with("USER: <image>\n"));
    }

    #[test]
    fn test_interleaved_images_get_separate_spans() {
        let config = registry::defaults(ArchitectureFamily::Llava);
        let tokenizer = testing::tokenizer();
        let media = vec![testing::image_item(336, 336), testing::image_item(336, 336)];

        let composed = compose(&PromptSpec::new("describe", &media), &config, &tokenizer).unwrap();
        let (first, second) = (composed.spans[0], composed.spans[1]);
        assert_eq!((first.media_index, second.media_index), (0, 1));
        // separator text keeps the runs apart
        assert!(second.start > first.end());
        assert_eq!(composed.placeholder_count(), 2 * 576);
    }

    #[test]
    fn test_marker_in_text_rejected_for_non_inline_family() {
        let config = registry::defaults(ArchitectureFamily::Llava);
        let tokenizer = testing::tokenizer();
        let media = vec![testing::image_item(336, 336)];

        let err = compose(&PromptSpec::new("look <image> here", &media), &config, &tokenizer).unwrap_err();
        assert!(matches!(err, VlmError::InvalidPrompt(_)));
    }

    #[test]
    fn test_inline_markers_must_match_media_count() {
        let config = registry::defaults(ArchitectureFamily::Phi3V);
        let tokenizer = WordTokenizer::new(["compare", "and"]).with_special(["<|image|>", "<|user|>", "<|end|>", "<|assistant|>"]);
        let media = vec![testing::image_item(336, 336), testing::image_item(336, 336)];

        let spec = PromptSpec::new("compare <|image|> and <|image|>", &media);
        let composed = compose(&spec, &config, &tokenizer).unwrap();
        assert_eq!(composed.spans.len(), 2);
        let and = tokenizer.token_to_id("and").unwrap();
        let and_pos = composed.tokens.iter().position(|t| *t == and).unwrap();
        assert!(composed.spans[0].end() <= and_pos && and_pos < composed.spans[1].start);

        let spec = PromptSpec::new("compare <|image|>", &media);
        assert!(matches!(
            compose(&spec, &config, &tokenizer),
            Err(VlmError::InvalidPrompt(_))
        ));
    }

    #[test]
    fn test_video_on_image_only_family() {
        let config = registry::defaults(ArchitectureFamily::Llava);
        let tokenizer = testing::tokenizer();
        let media = vec![testing::video_item(4, 224, 224)];
        let err = compose(&PromptSpec::new("describe", &media), &config, &tokenizer).unwrap_err();
        assert!(matches!(err, VlmError::UnsupportedMedia(_)));
    }

    #[test]
    fn test_text_only_prompt() {
        let config = registry::defaults(ArchitectureFamily::Qwen2Vl);
        let tokenizer = testing::tokenizer();
        let composed = compose(&PromptSpec::new("describe", &[]).with_system("be brief"), &config, &tokenizer).unwrap();
        assert!(composed.spans.is_empty());
        assert!(composed.prompt.contains("be brief"));
        assert!(!composed.prompt.contains("You are a helpful assistant."));
    }

    #[test]
    fn test_marker_in_system_prompt_rejected() {
        let config = registry::defaults(ArchitectureFamily::Llava);
        let tokenizer = testing::tokenizer();
        let media = vec![testing::image_item(336, 336)];

        let spec = PromptSpec::new("describe", &media).with_system("you see <image>");
        let err = compose(&spec, &config, &tokenizer).unwrap_err();
        assert!(matches!(err, VlmError::InvalidPrompt(_)));
    }

    #[test]
    fn test_pixtral_rows_end_with_break_token() {
        let config = registry::defaults(ArchitectureFamily::Pixtral);
        let tokenizer = WordTokenizer::new(["describe"]).with_special(["[IMG]", "[IMG_BREAK]", "[INST]", "[/INST]"]);
        let media = vec![testing::image_item(64, 32)];

        let composed = compose(&PromptSpec::new("describe", &media), &config, &tokenizer).unwrap();
        let span = composed.spans[0];
        assert_eq!(span.len, config.vision_token_count(&media[0]).unwrap());
        assert_eq!(span.len, 2 * (4 + 1));

        let img = tokenizer.token_to_id("[IMG]").unwrap();
        let brk = tokenizer.token_to_id("[IMG_BREAK]").unwrap();
        let run = &composed.tokens[span.start..span.end()];
        assert_eq!(run, &[img, img, img, img, brk, img, img, img, img, brk]);
    }

    #[test]
    fn test_row_break_needs_a_token_id() {
        let config = registry::defaults(ArchitectureFamily::Pixtral);
        let tokenizer = WordTokenizer::new(["describe"]).with_special(["[IMG]", "[INST]", "[/INST]"]);
        let media = vec![testing::image_item(64, 32)];
        let err = compose(&PromptSpec::new("describe", &media), &config, &tokenizer).unwrap_err();
        assert!(matches!(err, VlmError::InvalidConfig(_)));
    }
}
