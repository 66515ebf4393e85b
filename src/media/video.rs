use super::image::{check_source_size, image_to_tensor};
use super::{MediaItem, MediaOptions};
use crate::core::{ModelConfig, Result, VlmError};
use candle_core::{Device, Tensor};
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, RgbImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Frames per second assumed for a GIF frame without a delay.
const GIF_DEFAULT_FPS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMetadata {
    pub fps: f64,
    pub total_frames: usize,
    pub width: usize,
    pub height: usize,
}

/// Random-access frame source.
pub trait VideoReader: Send {
    fn metadata(&self) -> VideoMetadata;
    fn read_frame(&mut self, index: usize) -> Result<RgbImage>;
}

/// Decoded frames held in memory.
pub struct InMemoryVideo {
    frames: Vec<RgbImage>,
    fps: f64,
}

impl InMemoryVideo {
    pub fn new(frames: Vec<RgbImage>, fps: f64) -> Self {
        Self { frames, fps }
    }

    /// Decodes every frame of an animated GIF.
    pub fn from_gif(bytes: &[u8]) -> Result<Self> {
        let decoder = GifDecoder::new(Cursor::new(bytes))?;
        let frames = decoder.into_frames().collect_frames()?;

        let fps = frames
            .first()
            .map(|f| {
                let (numer, denom) = f.delay().numer_denom_ms();
                if numer == 0 {
                    GIF_DEFAULT_FPS
                } else {
                    1000.0 * denom as f64 / numer as f64
                }
            })
            .unwrap_or(GIF_DEFAULT_FPS);

        let frames = frames
            .into_iter()
            .map(|f| DynamicImage::ImageRgba8(f.into_buffer()).to_rgb8())
            .collect();
        Ok(Self::new(frames, fps))
    }
}

impl VideoReader for InMemoryVideo {
    fn metadata(&self) -> VideoMetadata {
        let (width, height) = self
            .frames
            .first()
            .map(|f| (f.width() as usize, f.height() as usize))
            .unwrap_or((0, 0));
        VideoMetadata {
            fps: self.fps,
            total_frames: self.frames.len(),
            width,
            height,
        }
    }

    fn read_frame(&mut self, index: usize) -> Result<RgbImage> {
        self.frames
            .get(index)
            .cloned()
            .ok_or_else(|| VlmError::UnsupportedMedia(format!("frame {} out of range", index)))
    }
}

/// A directory of still images, one per frame, ordered by file name.
pub struct FrameDirReader {
    paths: Vec<PathBuf>,
    fps: f64,
    size: (usize, usize),
}

impl FrameDirReader {
    pub fn open<P: AsRef<Path>>(dir: P, fps: f64) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg" | "webp" | "bmp"))
                .unwrap_or(false);
            if is_image {
                paths.push(path);
            }
        }
        paths.sort();

        let size = match paths.first() {
            Some(first) => {
                let (w, h) = image::image_dimensions(first)?;
                (w as usize, h as usize)
            }
            None => (0, 0),
        };
        Ok(Self { paths, fps, size })
    }
}

impl VideoReader for FrameDirReader {
    fn metadata(&self) -> VideoMetadata {
        VideoMetadata {
            fps: self.fps,
            total_frames: self.paths.len(),
            width: self.size.0,
            height: self.size.1,
        }
    }

    fn read_frame(&mut self, index: usize) -> Result<RgbImage> {
        let path = self
            .paths
            .get(index)
            .ok_or_else(|| VlmError::UnsupportedMedia(format!("frame {} out of range", index)))?;
        Ok(image::open(path)?.to_rgb8())
    }
}

/// Which source frames were kept and at what rate.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSampling {
    pub source_fps: f64,
    pub total_frames: usize,
    pub fps: f64,
    pub indices: Vec<usize>,
    pub original_size: (usize, usize),
}

/// Indices of frames taken at `fps` from a `source_fps` stream, starting at 0.
pub fn fps_frame_indices(total_frames: usize, source_fps: f64, fps: f64) -> Result<Vec<usize>> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(VlmError::InvalidMediaOptions(format!(
            "sampling fps must be finite and positive, got {}",
            fps
        )));
    }
    if total_frames == 0 {
        return Ok(Vec::new());
    }
    // streams with no usable rate yield their first frame
    if !source_fps.is_finite() || source_fps <= 0.0 {
        return Ok(vec![0]);
    }

    let stride = source_fps / fps.min(source_fps);
    Ok((0..)
        .map(|i| (i as f64 * stride).round() as usize)
        .take_while(|&index| index < total_frames)
        .collect())
}

/// Evenly spaced positions in `0..total`, first included.
pub fn uniform_frame_indices(total: usize, samples: usize) -> Vec<usize> {
    if samples == 0 || total == 0 {
        return Vec::new();
    }
    if samples >= total {
        return (0..total).collect();
    }
    (0..samples)
        .map(|i| {
            let pos = i as f64 * (total - 1) as f64 / (samples - 1).max(1) as f64;
            pos.round() as usize
        })
        .collect()
}

/// Frame size for a video: fixed families keep their fixed size, others fit
/// the caller's box and round down to the patch factor.
pub fn frame_size(config: &ModelConfig, source: (usize, usize), options: &MediaOptions) -> (usize, usize) {
    let policy = config.image.resize;
    if policy.is_fixed() {
        return policy.target_size(source.0, source.1);
    }

    let (src_w, src_h) = (source.0.max(1), source.1.max(1));
    let max_w = options.max_width.unwrap_or(src_w).max(1);
    let max_h = options.max_height.unwrap_or(src_h).max(1);
    let scale = (max_w as f64 / src_w as f64)
        .min(max_h as f64 / src_h as f64)
        .min(1.0);
    let fit_w = ((src_w as f64 * scale).floor() as usize).max(1);
    let fit_h = ((src_h as f64 * scale).floor() as usize).max(1);

    let factor = config
        .video_tokens
        .map(|v| v.per_frame.spatial_factor())
        .unwrap_or(1)
        .max(1);
    let round = |side: usize| ((side / factor) * factor).max(factor);
    (round(fit_w), round(fit_h))
}

pub fn preprocess_video(
    reader: &mut dyn VideoReader,
    config: &ModelConfig,
    options: &MediaOptions,
    device: &Device,
) -> Result<MediaItem> {
    if !config.supports_video() {
        return Err(VlmError::UnsupportedMedia(format!(
            "{} does not accept video",
            config.model_type
        )));
    }

    let meta = reader.metadata();
    if meta.total_frames == 0 {
        return Err(VlmError::UnsupportedMedia("video has no frames".to_string()));
    }
    check_source_size(meta.width, meta.height, meta.total_frames, config.image.max_source_pixels)?;

    let fps = options.fps.unwrap_or(config.video.default_fps);
    let candidates = fps_frame_indices(meta.total_frames, meta.fps, fps)?;

    let (width, height) = frame_size(config, (meta.width, meta.height), options);
    let budget = options.max_total_pixels.unwrap_or(config.video.max_total_pixels);
    let budget_frames = budget / (width * height);
    if budget_frames == 0 {
        return Err(VlmError::ResourceTooLarge {
            width,
            height,
            frames: 1,
            limit: budget,
        });
    }
    let cap = budget_frames.min(options.max_frames.unwrap_or(config.video.max_frames).max(1));

    let indices: Vec<usize> = if candidates.len() > cap {
        uniform_frame_indices(candidates.len(), cap)
            .into_iter()
            .map(|i| candidates[i])
            .collect()
    } else {
        candidates
    };
    debug!(?indices, width, height, source_fps = meta.fps, "sampled video frames");

    let frames = indices
        .iter()
        .map(|&index| {
            let frame = reader.read_frame(index)?;
            image_to_tensor(&frame, width, height, &config.image, device)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(MediaItem::Video {
        frames: Tensor::stack(&frames, 0)?,
        sampling: VideoSampling {
            source_fps: meta.fps,
            total_frames: meta.total_frames,
            fps: fps.min(meta.fps),
            indices,
            original_size: (meta.width, meta.height),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{registry, ArchitectureFamily};

    #[test]
    fn test_fps_indices() {
        let indices = fps_frame_indices(300, 30.0, 1.0).unwrap();
        assert_eq!(indices, vec![0, 30, 60, 90, 120, 150, 180, 210, 240, 270]);

        // requested rate above the source rate keeps every frame
        assert_eq!(fps_frame_indices(5, 2.0, 10.0).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(fps_frame_indices(10, 4.0, 1.5).unwrap().first(), Some(&0));
        assert!(fps_frame_indices(0, 30.0, 1.0).unwrap().is_empty());
        assert_eq!(fps_frame_indices(10, f64::NAN, 1.0).unwrap(), vec![0]);
    }

    #[test]
    fn test_bad_sampling_fps_rejected() {
        for fps in [f64::NAN, f64::INFINITY, 0.0, -1.0] {
            assert!(matches!(
                fps_frame_indices(300, 30.0, fps),
                Err(VlmError::InvalidMediaOptions(_))
            ));
        }
    }

    #[test]
    fn test_uniform_indices_include_first() {
        assert_eq!(uniform_frame_indices(10, 4), vec![0, 3, 6, 9]);
        assert_eq!(uniform_frame_indices(3, 5), vec![0, 1, 2]);
        assert_eq!(uniform_frame_indices(7, 1), vec![0]);
    }

    #[test]
    fn test_budget_reselects_uniformly() {
        let config = registry::defaults(ArchitectureFamily::Qwen2Vl);
        let frames = (0..60).map(|_| RgbImage::new(56, 56)).collect();
        let mut video = InMemoryVideo::new(frames, 10.0);
        let options = MediaOptions {
            fps: Some(10.0),
            max_total_pixels: Some(56 * 56 * 4),
            ..Default::default()
        };

        let item = preprocess_video(&mut video, &config, &options, &Device::Cpu).unwrap();
        let MediaItem::Video { frames, sampling } = item else {
            panic!("expected video");
        };
        assert_eq!(frames.dims(), &[4, 3, 56, 56]);
        assert_eq!(sampling.indices[0], 0);
        assert_eq!(sampling.indices.len(), 4);
    }

    #[test]
    fn test_video_rejected_for_image_only_family() {
        let config = registry::defaults(ArchitectureFamily::Llava);
        let mut video = InMemoryVideo::new(vec![RgbImage::new(8, 8)], 1.0);
        let err = preprocess_video(&mut video, &config, &MediaOptions::default(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, VlmError::UnsupportedMedia(_)));
    }
}
