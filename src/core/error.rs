use thiserror::Error;

#[derive(Debug, Error)]
pub enum VlmError {
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("media too large: {width}x{height}x{frames} pixels exceeds limit of {limit}")]
    ResourceTooLarge {
        width: usize,
        height: usize,
        frames: usize,
        limit: usize,
    },

    #[error("invalid media options: {0}")]
    InvalidMediaOptions(String),

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    /// Composer bookkeeping disagrees with the vision-token formula. Indicates a
    /// config or formula bug, never a user input problem.
    #[error("placeholder mismatch: expected {expected} placeholder tokens, composed {actual}")]
    PlaceholderMismatch { expected: usize, actual: usize },

    #[error("vision encoder returned {actual} tokens for media item {index}, formula predicts {expected}")]
    EncodingShapeError {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("shape mismatch on layer {layer}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("invalid model config: {0}")]
    InvalidConfig(String),

    #[error("context overflow: {requested} tokens requested, window holds {capacity}")]
    ContextOverflow { requested: usize, capacity: usize },

    #[error("invalid logits: {0}")]
    InvalidLogits(String),

    #[error("no backend registered for architecture {0}")]
    MissingBackend(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Template(#[from] minijinja::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<tokenizers::Error> for VlmError {
    fn from(err: tokenizers::Error) -> Self {
        VlmError::Tokenizer(err.to_string())
    }
}

impl From<image::ImageError> for VlmError {
    fn from(err: image::ImageError) -> Self {
        VlmError::UnsupportedMedia(err.to_string())
    }
}

impl VlmError {
    /// Structural errors mean model and preprocessing disagree; retrying the
    /// same request cannot succeed.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            VlmError::UnknownArchitecture(_)
                | VlmError::PlaceholderMismatch { .. }
                | VlmError::EncodingShapeError { .. }
                | VlmError::ShapeMismatch { .. }
                | VlmError::InvalidConfig(_)
                | VlmError::MissingBackend(_)
        )
    }
}
