use super::traits::Tokenizer;
use crate::core::{Result, TokenId};
use std::sync::Arc;

/// Incremental detokenizer. Emits only the text a new token completes, so
/// multi-token characters never surface half-decoded.
pub struct TokenStream {
    tokenizer: Arc<dyn Tokenizer>,
    tokens: Vec<TokenId>,
    prev_index: usize,
    current_index: usize,
    text: String,
}

impl TokenStream {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
            text: String::new(),
        }
    }

    pub fn push(&mut self, token: TokenId) -> Result<Option<String>> {
        let prev_text = self.decode_window(self.prev_index, self.current_index)?;
        self.tokens.push(token);
        let text = self.decode_window(self.prev_index, self.tokens.len())?;

        if text.len() > prev_text.len() && !text.ends_with(char::REPLACEMENT_CHARACTER) {
            let delta = match text.get(prev_text.len()..) {
                Some(delta) => delta.to_string(),
                None => return Ok(None),
            };
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            self.text.push_str(&delta);
            Ok(Some(delta))
        } else {
            Ok(None)
        }
    }

    /// Emits whatever is still held back.
    pub fn flush(&mut self) -> Result<Option<String>> {
        let prev_text = self.decode_window(self.prev_index, self.current_index)?;
        let text = self.decode_window(self.prev_index, self.tokens.len())?;
        self.prev_index = self.current_index;
        self.current_index = self.tokens.len();

        match text.get(prev_text.len()..) {
            Some(delta) if !delta.is_empty() => {
                let delta = delta.to_string();
                self.text.push_str(&delta);
                Ok(Some(delta))
            }
            _ => Ok(None),
        }
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    fn decode_window(&self, start: usize, end: usize) -> Result<String> {
        if start >= end {
            return Ok(String::new());
        }
        self.tokenizer.decode(&self.tokens[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::WordTokenizer;

    #[test]
    fn test_stream_matches_full_decode() {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(WordTokenizer::new(["the", "cat", "sat"]));
        let ids = tokenizer.encode("the cat sat").unwrap();

        let mut stream = TokenStream::new(Arc::clone(&tokenizer));
        let mut pieces = Vec::new();
        for id in &ids {
            if let Some(piece) = stream.push(*id).unwrap() {
                pieces.push(piece);
            }
        }
        if let Some(rest) = stream.flush().unwrap() {
            pieces.push(rest);
        }

        assert_eq!(pieces.concat(), tokenizer.decode(&ids).unwrap());
        assert_eq!(stream.text(), "the cat sat");
        assert_eq!(stream.tokens().len(), 3);
    }
}
