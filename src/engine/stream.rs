//! Incremental detokenization for streamed replies
//!
//! Byte-level BPE vocabularies split multi-byte characters across tokens, so
//! decoding one id at a time yields replacement characters. The decoder keeps
//! the reply's ids and only releases text once the tail decodes to complete
//! characters.

use crate::error::ForgeResult;
use crate::tokenizer::Tokenizer;

const INCOMPLETE: char = '\u{FFFD}';

#[derive(Debug, Default)]
pub struct StreamDecoder {
    tokens: Vec<usize>,
    /// Start of the window re-decoded for context
    prefix_idx: usize,
    /// First token whose text has not been released yet
    read_idx: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids pushed so far
    pub fn tokens(&self) -> &[usize] {
        &self.tokens
    }

    /// Append `token`; returns newly completed text, if any
    pub fn push<T: Tokenizer>(&mut self, tokenizer: &T, token: usize) -> ForgeResult<Option<String>> {
        self.tokens.push(token);
        let (prefix, text) = self.window(tokenizer)?;
        if text.len() <= prefix.len() || text.ends_with(INCOMPLETE) {
            return Ok(None);
        }
        Ok(self.release(&prefix, &text))
    }

    /// Release whatever is still held back, complete or not
    pub fn flush<T: Tokenizer>(&mut self, tokenizer: &T) -> ForgeResult<Option<String>> {
        if self.read_idx == self.tokens.len() {
            return Ok(None);
        }
        let (prefix, text) = self.window(tokenizer)?;
        Ok(self.release(&prefix, &text))
    }

    fn window<T: Tokenizer>(&self, tokenizer: &T) -> ForgeResult<(String, String)> {
        let prefix = tokenizer.decode(&self.tokens[self.prefix_idx..self.read_idx])?;
        let text = tokenizer.decode(&self.tokens[self.prefix_idx..])?;
        Ok((prefix, text))
    }

    fn release(&mut self, prefix: &str, text: &str) -> Option<String> {
        let piece = match text.strip_prefix(prefix) {
            Some(rest) => rest,
            // Decoders may rewrite the window's leading text; fall back to a
            // char-aligned cut.
            None => text.get(prefix.len()..).unwrap_or(""),
        };
        self.prefix_idx = self.read_idx;
        self.read_idx = self.tokens.len();
        (!piece.is_empty()).then(|| piece.to_string())
    }
}
