use crate::{ComposeArgs, GenerateArgs, MediaArgs};
use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use serde_json::json;
use std::io::{self, Write};
use std::path::Path;
use vlm::core::model::{registry, store::read_metadata, BackendRegistry, LocalModelStore};
use vlm::core::{select_device, HfTokenizer, ModelConfig};
use vlm::envconfig::EnvConfig;
use vlm::generate::{GenerateOptions, SamplingParams, StopReason};
use vlm::lora::{LoraMode, LoraWeights};
use vlm::media::{self, MediaItem, MediaKind, MediaOptions, MediaSource};
use vlm::prompt::{self, PromptSpec};
use vlm::ModelContext;

/// Parses `WxH` into `(width, height)`.
pub fn parse_size(s: &str) -> std::result::Result<(usize, usize), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got {s}"))?;
    let w = w.trim().parse().map_err(|_| format!("bad width in {s}"))?;
    let h = h.trim().parse().map_err(|_| format!("bad height in {s}"))?;
    Ok((w, h))
}

fn media_options(args: &MediaArgs, env: &EnvConfig) -> MediaOptions {
    MediaOptions {
        fps: args.fps,
        max_width: args.max_pixels.map(|(w, _)| w),
        max_height: args.max_pixels.map(|(_, h)| h),
        proxy: args.proxy.clone().or_else(|| env.proxy.clone()),
        ..Default::default()
    }
}

fn load_media(args: &MediaArgs, config: &ModelConfig, env: &EnvConfig, device: &Device) -> Result<Vec<MediaItem>> {
    let options = media_options(args, env);
    let mut items = Vec::with_capacity(args.images.len() + 1);
    for image in &args.images {
        let item = media::preprocess(MediaSource::parse(image), MediaKind::Image, config, &options, device)
            .with_context(|| format!("failed to load image {image}"))?;
        items.push(item);
    }
    if let Some(video) = &args.video {
        let item = media::preprocess(MediaSource::parse(video), MediaKind::Video, config, &options, device)
            .with_context(|| format!("failed to load video {video}"))?;
        items.push(item);
    }
    Ok(items)
}

fn prompt_spec<'a>(args: &'a ComposeArgs, media: &'a [MediaItem]) -> PromptSpec<'a> {
    let spec = PromptSpec::new(&args.prompt, media);
    match &args.system {
        Some(system) => spec.with_system(system),
        None => spec,
    }
}

pub fn generate(args: GenerateArgs) -> Result<()> {
    let env = EnvConfig::from_env();
    let device = select_device(args.cpu)?;
    let backends = BackendRegistry::new();

    let model = &args.compose.model;
    let ctx = ModelContext::load(model, &backends, &device).with_context(|| format!("failed to load {model}"))?;

    if let Some(dir) = &args.adapter {
        let mode: LoraMode = args.adapter_mode.parse()?;
        let weights = LoraWeights::load(Path::new(dir), &device)
            .with_context(|| format!("failed to load adapter {dir}"))?;
        let layers = ctx.apply_lora(&weights, mode)?;
        eprintln!("adapter {} applied to {} layers", weights.name, layers.len());
    }

    let media = load_media(&args.compose.media, ctx.config(), &env, &device)?;
    let options = GenerateOptions {
        max_tokens: args.max_tokens.unwrap_or(env.max_tokens),
        sampling: SamplingParams {
            temperature: args.temperature.unwrap_or(env.temperature),
            top_p: args.top_p,
            repetition_penalty: args.repetition_penalty,
            seed: args.seed,
            ..Default::default()
        },
        ..Default::default()
    };

    let cancel = options.cancel.clone();
    ctrlc::set_handler(move || cancel.cancel()).context("failed to install Ctrl-C handler")?;

    let mut stream = ctx.generate(&prompt_spec(&args.compose, &media), options)?;
    let mut stdout = io::stdout();
    for piece in stream.by_ref() {
        print!("{}", piece?);
        stdout.flush()?;
    }
    println!();

    if stream.stop_reason() == Some(StopReason::Cancelled) {
        eprintln!("generation cancelled after {} tokens", stream.generated_tokens().len());
    }
    Ok(())
}

pub fn compose(args: ComposeArgs) -> Result<()> {
    let env = EnvConfig::from_env();
    let store = LocalModelStore::from_env();
    let dir = store.locate(&args.model).with_context(|| format!("model {} not found", args.model))?;
    let config = registry::resolve_metadata(&read_metadata(&dir)?)?;
    let tokenizer = HfTokenizer::from_model_dir(&dir)?;

    let media = load_media(&args.media, &config, &env, &Device::Cpu)?;
    let composed = prompt::compose(&prompt_spec(&args, &media), &config, &tokenizer)?;

    let layout = json!({
        "family": config.family,
        "prompt": composed.prompt,
        "tokens": composed.len(),
        "placeholders": composed.placeholder_count(),
        "spans": composed.spans,
    });
    println!("{}", serde_json::to_string_pretty(&layout)?);
    Ok(())
}

pub fn config(model: &str) -> Result<()> {
    let config = registry::resolve(model).map_err(|e| anyhow!("cannot resolve {model}: {e}"))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("224x160").unwrap(), (224, 160));
        assert_eq!(parse_size("64X64").unwrap(), (64, 64));
        assert!(parse_size("224").is_err());
        assert!(parse_size("ax2").is_err());
    }
}
