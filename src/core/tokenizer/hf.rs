use super::traits::{DecodeOptions, EncodeOptions, Tokenizer};
use crate::core::{Result, TokenId, VlmError};
use std::path::Path;

/// `tokenizer.json` backed tokenizer.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        Self { inner }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            VlmError::Tokenizer(format!("failed to load {}: {}", path.display(), e))
        })?;
        Ok(Self { inner })
    }

    pub fn from_model_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::from_file(dir.as_ref().join("tokenizer.json"))
    }
}

impl Tokenizer for HfTokenizer {
    fn encode_with_options(&self, text: &str, options: &EncodeOptions) -> Result<Vec<TokenId>> {
        let encoding = self.inner.encode(text, options.add_special_tokens)?;
        let mut ids: Vec<TokenId> = encoding.get_ids().iter().copied().map(TokenId).collect();
        if let Some(max_len) = options.truncate {
            ids.truncate(max_len);
        }
        Ok(ids)
    }

    fn decode_with_options(&self, tokens: &[TokenId], options: &DecodeOptions) -> Result<String> {
        let ids: Vec<u32> = tokens.iter().map(|t| t.0).collect();
        Ok(self.inner.decode(&ids, options.skip_special_tokens)?)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.inner.token_to_id(token).map(TokenId)
    }

    fn id_to_token(&self, id: TokenId) -> Option<String> {
        self.inner.id_to_token(id.0)
    }
}
