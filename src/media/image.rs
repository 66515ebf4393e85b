use super::MediaItem;
use crate::core::model::ImagePreprocessing;
use crate::core::{ModelConfig, Result, VlmError};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{ImageReader, RgbImage};
use std::io::Cursor;
use tracing::debug;

pub fn check_source_size(width: usize, height: usize, frames: usize, limit: usize) -> Result<()> {
    if width.saturating_mul(height) > limit {
        return Err(VlmError::ResourceTooLarge {
            width,
            height,
            frames,
            limit,
        });
    }
    Ok(())
}

/// Decodes an encoded still image, rejecting oversized sources before the
/// pixel buffer is allocated.
pub fn decode_image(bytes: &[u8], max_source_pixels: usize) -> Result<RgbImage> {
    let (width, height) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?;
    check_source_size(width as usize, height as usize, 1, max_source_pixels)?;

    let image = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;
    Ok(image.to_rgb8())
}

/// Resizes to `width`×`height` and produces a normalized `[3, H, W]` f32 tensor.
pub fn image_to_tensor(
    image: &RgbImage,
    width: usize,
    height: usize,
    config: &ImagePreprocessing,
    device: &Device,
) -> Result<Tensor> {
    let resized;
    let image = if image.width() as usize == width && image.height() as usize == height {
        image
    } else {
        resized = image::imageops::resize(image, width as u32, height as u32, FilterType::CatmullRom);
        &resized
    };

    let mean = Tensor::from_slice(&config.mean, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&config.std, (3, 1, 1), device)?;

    let pixels = Tensor::from_vec(image.as_raw().clone(), (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(config.rescale_factor as f64, 0.0)?;

    Ok(pixels.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

pub fn preprocess_image(image: &RgbImage, config: &ModelConfig, device: &Device) -> Result<MediaItem> {
    let original_size = (image.width() as usize, image.height() as usize);
    check_source_size(original_size.0, original_size.1, 1, config.image.max_source_pixels)?;

    let (width, height) = config.image.resize.target_size(original_size.0, original_size.1);
    debug!(?original_size, width, height, "resizing image");

    let pixels = image_to_tensor(image, width, height, &config.image, device)?;
    Ok(MediaItem::Image { pixels, original_size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{registry, ArchitectureFamily};
    use approx::assert_relative_eq;
    use image::Rgb;

    #[test]
    fn test_normalization() {
        let image = RgbImage::from_pixel(4, 2, Rgb([255, 0, 128]));
        let config = ImagePreprocessing {
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
            ..Default::default()
        };
        let tensor = image_to_tensor(&image, 4, 2, &config, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 2, 4]);

        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_relative_eq!(values[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(values[8], -1.0, epsilon = 1e-5);
        assert_relative_eq!(values[16], 128.0 / 255.0 * 2.0 - 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_fixed_family_resizes_to_fixed_size() {
        let config = registry::defaults(ArchitectureFamily::Paligemma);
        let image = RgbImage::new(640, 480);
        let item = preprocess_image(&image, &config, &Device::Cpu).unwrap();
        assert_eq!(item.spatial_size(), (224, 224));
        assert_eq!(config.vision_token_count(&item).unwrap(), 256);
    }

    #[test]
    fn test_oversized_source_rejected() {
        let mut config = registry::defaults(ArchitectureFamily::Llava);
        config.image.max_source_pixels = 100;
        let image = RgbImage::new(20, 20);
        let err = preprocess_image(&image, &config, &Device::Cpu).unwrap_err();
        assert!(matches!(err, VlmError::ResourceTooLarge { width: 20, height: 20, .. }));
    }

    #[test]
    fn test_undecodable_bytes_are_unsupported() {
        let err = decode_image(b"definitely not a png", 1 << 20).unwrap_err();
        assert!(matches!(err, VlmError::UnsupportedMedia(_)));
    }
}
