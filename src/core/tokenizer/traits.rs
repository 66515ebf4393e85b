use crate::core::{Result, TokenId};

pub trait Tokenizer: Send + Sync {
    fn encode_with_options(&self, text: &str, options: &EncodeOptions) -> Result<Vec<TokenId>>;
    fn decode_with_options(&self, tokens: &[TokenId], options: &DecodeOptions) -> Result<String>;

    fn vocab_size(&self) -> usize;

    fn token_to_id(&self, token: &str) -> Option<TokenId>;
    fn id_to_token(&self, id: TokenId) -> Option<String>;

    /// Encodes raw text. Special tokens written literally in `text` are
    /// recognized, none are added.
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        self.encode_with_options(text, &EncodeOptions::default())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        self.decode_with_options(tokens, &DecodeOptions::new().skip_special())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    pub add_special_tokens: bool,
    pub truncate: Option<usize>,
}

impl EncodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_special_tokens(mut self) -> Self {
        self.add_special_tokens = true;
        self
    }

    pub fn truncate(mut self, max_len: usize) -> Self {
        self.truncate = Some(max_len);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    pub skip_special_tokens: bool,
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_special(mut self) -> Self {
        self.skip_special_tokens = true;
        self
    }
}
