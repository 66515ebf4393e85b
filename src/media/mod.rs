//! Turns raw images and videos into normalized pixel tensors sized for a
//! model family.

pub mod image;
pub mod source;
pub mod video;

pub use source::MediaSource;
pub use video::{FrameDirReader, InMemoryVideo, VideoMetadata, VideoReader, VideoSampling};

use crate::core::{ModelConfig, Result, VlmError};
use ::image::ImageFormat;
use candle_core::Tensor;
use candle_core::Device;

/// Frame rate assumed for a frame directory when the caller gives none.
pub const DEFAULT_FRAME_DIR_FPS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Video,
}

/// A preprocessed media item, ready for the vision encoder.
#[derive(Debug, Clone)]
pub enum MediaItem {
    /// `pixels` is `[3, H, W]`.
    Image {
        pixels: Tensor,
        original_size: (usize, usize),
    },
    /// `frames` is `[F, 3, H, W]`.
    Video { frames: Tensor, sampling: VideoSampling },
}

impl MediaItem {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaItem::Image { .. } => MediaKind::Image,
            MediaItem::Video { .. } => MediaKind::Video,
        }
    }

    pub fn pixels(&self) -> &Tensor {
        match self {
            MediaItem::Image { pixels, .. } => pixels,
            MediaItem::Video { frames, .. } => frames,
        }
    }

    /// `(width, height)` after resizing.
    pub fn spatial_size(&self) -> (usize, usize) {
        let dims = self.pixels().dims();
        match dims {
            [.., h, w] => (*w, *h),
            _ => (0, 0),
        }
    }

    pub fn frame_count(&self) -> usize {
        match self {
            MediaItem::Image { .. } => 1,
            MediaItem::Video { sampling, .. } => sampling.indices.len(),
        }
    }
}

/// Per-call overrides; unset fields fall back to the model config.
#[derive(Debug, Clone, Default)]
pub struct MediaOptions {
    pub fps: Option<f64>,
    pub max_width: Option<usize>,
    pub max_height: Option<usize>,
    pub max_total_pixels: Option<usize>,
    pub max_frames: Option<usize>,
    /// Rate of a frame directory, which carries no timing of its own.
    pub source_fps: Option<f64>,
    pub proxy: Option<String>,
}

pub fn preprocess(
    source: MediaSource,
    kind: MediaKind,
    config: &ModelConfig,
    options: &MediaOptions,
    device: &Device,
) -> Result<MediaItem> {
    match kind {
        MediaKind::Image => {
            let bytes = source.read_bytes(options.proxy.as_deref())?;
            let decoded = image::decode_image(&bytes, config.image.max_source_pixels)?;
            image::preprocess_image(&decoded, config, device)
        }
        MediaKind::Video => {
            let mut reader = open_video(source, options)?;
            video::preprocess_video(reader.as_mut(), config, options, device)
        }
    }
}

fn open_video(source: MediaSource, options: &MediaOptions) -> Result<Box<dyn VideoReader>> {
    match source {
        MediaSource::Reader(reader) => Ok(reader),
        MediaSource::Path(path) if path.is_dir() => Ok(Box::new(FrameDirReader::open(
            &path,
            options.source_fps.unwrap_or(DEFAULT_FRAME_DIR_FPS),
        )?)),
        other => {
            let bytes = other.read_bytes(options.proxy.as_deref())?;
            match ::image::guess_format(&bytes) {
                Ok(ImageFormat::Gif) => Ok(Box::new(InMemoryVideo::from_gif(&bytes)?)),
                _ => Err(VlmError::UnsupportedMedia(
                    "video must be an animated gif, a frame directory, or a frame reader".to_string(),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{registry, ArchitectureFamily};
    use ::image::{Rgb, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_preprocess_png_bytes() {
        let config = registry::defaults(ArchitectureFamily::Qwen2Vl);
        let item = preprocess(
            MediaSource::Bytes(png_bytes(448, 448)),
            MediaKind::Image,
            &config,
            &MediaOptions::default(),
            &Device::Cpu,
        )
        .unwrap();

        assert_eq!(item.kind(), MediaKind::Image);
        assert_eq!(item.spatial_size(), (448, 448));
        assert_eq!(config.vision_token_count(&item).unwrap(), 256);
    }

    #[test]
    fn test_png_is_not_a_video() {
        let config = registry::defaults(ArchitectureFamily::Qwen2Vl);
        let err = preprocess(
            MediaSource::Bytes(png_bytes(8, 8)),
            MediaKind::Video,
            &config,
            &MediaOptions::default(),
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, VlmError::UnsupportedMedia(_)));
    }

    #[test]
    fn test_frame_directory_video() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            RgbImage::new(56, 56)
                .save(dir.path().join(format!("frame_{:03}.png", i)))
                .unwrap();
        }
        let config = registry::defaults(ArchitectureFamily::Qwen25Vl);
        let options = MediaOptions {
            fps: Some(1.0),
            source_fps: Some(2.0),
            ..Default::default()
        };
        let item = preprocess(
            MediaSource::Path(dir.path().to_path_buf()),
            MediaKind::Video,
            &config,
            &options,
            &Device::Cpu,
        )
        .unwrap();

        let MediaItem::Video { sampling, .. } = &item else {
            panic!("expected video");
        };
        assert_eq!(sampling.indices, vec![0, 2, 4]);
        assert_eq!(config.vision_token_count(&item).unwrap(), 2 * 4);
    }
}
