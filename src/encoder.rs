use crate::core::{ModelConfig, Result, VisionLanguageModel, VlmError};
use crate::media::MediaItem;
use crate::prompt::ComposedSequence;
use candle_core::Tensor;
use tracing::debug;

/// Produces the `[seq, hidden]` input embeddings for a composed sequence:
/// text embeddings everywhere, vision embeddings over each placeholder span.
pub fn encode(
    model: &dyn VisionLanguageModel,
    config: &ModelConfig,
    sequence: &ComposedSequence,
    media: &[MediaItem],
) -> Result<Tensor> {
    if sequence.spans.len() != media.len() {
        return Err(VlmError::PlaceholderMismatch {
            expected: media.len(),
            actual: sequence.spans.len(),
        });
    }

    let text = model.embed_tokens(&sequence.tokens)?;
    if sequence.spans.is_empty() {
        return Ok(text);
    }

    let mut segments = Vec::with_capacity(sequence.spans.len() * 2 + 1);
    let mut cursor = 0;
    for span in &sequence.spans {
        let item = &media[span.media_index];
        let expected = config.vision_token_count(item)?;
        if expected != span.len {
            return Err(VlmError::PlaceholderMismatch {
                expected,
                actual: span.len,
            });
        }

        let vision = model.encode_media(item)?;
        let actual = vision.dim(0)?;
        if actual != span.len {
            return Err(VlmError::EncodingShapeError {
                index: span.media_index,
                expected: span.len,
                actual,
            });
        }

        if span.start > cursor {
            segments.push(text.narrow(0, cursor, span.start - cursor)?);
        }
        segments.push(vision.to_dtype(text.dtype())?);
        cursor = span.end();
    }
    let seq_len = text.dim(0)?;
    if cursor < seq_len {
        segments.push(text.narrow(0, cursor, seq_len - cursor)?);
    }

    let merged = Tensor::cat(&segments, 0)?;
    debug!(seq_len, media = media.len(), "merged vision embeddings");
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{compose, PromptSpec};
    use crate::testing::{self, TinyVlm};
    use candle_core::{Device, IndexOp};

    #[test]
    fn test_vision_rows_replace_placeholders() {
        let config = testing::config();
        let tokenizer = testing::tokenizer();
        let model = TinyVlm::new(&config, &Device::Cpu).unwrap();
        let media = vec![testing::image_item(32, 32)];

        let composed = compose(&PromptSpec::new("describe the image", &media), &config, &tokenizer).unwrap();
        let embeds = encode(&model, &config, &composed, &media).unwrap();
        assert_eq!(embeds.dims(), &[composed.len(), model.meta().hidden_size]);

        let span = composed.spans[0];
        let text = model.embed_tokens(&composed.tokens).unwrap();
        let before = span.start - 1;
        assert_eq!(
            embeds.i(before).unwrap().to_vec1::<f32>().unwrap(),
            text.i(before).unwrap().to_vec1::<f32>().unwrap()
        );
        assert_ne!(
            embeds.i(span.start).unwrap().to_vec1::<f32>().unwrap(),
            text.i(span.start).unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_encoder_token_drift_is_a_shape_error() {
        let config = testing::config();
        let tokenizer = testing::tokenizer();
        let model = TinyVlm::new(&config, &Device::Cpu).unwrap().with_token_drift(1);
        let media = vec![testing::image_item(32, 32)];

        let composed = compose(&PromptSpec::new("describe", &media), &config, &tokenizer).unwrap();
        let err = encode(&model, &config, &composed, &media).unwrap_err();
        assert!(matches!(
            err,
            VlmError::EncodingShapeError { index: 0, expected: 4, actual: 5 }
        ));
    }
}
