//! Tokenizer abstraction backed by Hugging Face `tokenizers`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

use crate::error::{ForgeError, ForgeResult};

/// Token that closes a chat turn
pub const IM_END: &str = "<|im_end|>";
/// Token that closes a document
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Text <-> token id conversion used by generation
pub trait Tokenizer {
    fn encode(&self, text: &str) -> ForgeResult<Vec<usize>>;

    fn decode(&self, ids: &[usize]) -> ForgeResult<String>;

    fn vocab_size(&self) -> usize;

    /// Whether generation should stop after `token`
    fn is_sentence_ending(&self, token: usize) -> bool;
}

/// `tokenizer.json` tokenizer with Qwen2 end-of-generation tokens
#[derive(Clone)]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    end_tokens: Vec<usize>,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> ForgeResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            ForgeError::TokenizerLoadFailed(format!("'{}': {}", path.display(), e))
        })?;
        Ok(Self::wrap(inner))
    }

    pub fn from_json(json: &str) -> ForgeResult<Self> {
        let inner = tokenizers::Tokenizer::from_str(json)
            .map_err(|e| ForgeError::TokenizerLoadFailed(e.to_string()))?;
        Ok(Self::wrap(inner))
    }

    fn wrap(inner: tokenizers::Tokenizer) -> Self {
        let end_tokens: Vec<usize> = [IM_END, END_OF_TEXT]
            .iter()
            .filter_map(|t| inner.token_to_id(t))
            .map(|id| id as usize)
            .collect();
        if end_tokens.is_empty() {
            warn!("tokenizer defines no end-of-generation token; generation stops only at the step limit");
        }
        Self { inner, end_tokens }
    }

    pub fn end_tokens(&self) -> &[usize] {
        &self.end_tokens
    }
}

fn to_u32(ids: &[usize]) -> ForgeResult<Vec<u32>> {
    ids.iter()
        .map(|&id| {
            u32::try_from(id).map_err(|_| ForgeError::TokenizerError(format!("token id {} out of range", id)))
        })
        .collect()
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> ForgeResult<Vec<usize>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ForgeError::TokenizerError(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as usize).collect())
    }

    fn decode(&self, ids: &[usize]) -> ForgeResult<String> {
        self.inner
            .decode(&to_u32(ids)?, true)
            .map_err(|e| ForgeError::TokenizerError(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn is_sentence_ending(&self, token: usize) -> bool {
        self.end_tokens.contains(&token)
    }
}

/// Look for a tokenizer next to the weight file
pub fn infer_tokenizer_path(model_path: &Path) -> Option<PathBuf> {
    let dir = model_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(stem) = model_path.file_stem().and_then(|s| s.to_str()) {
        candidates.push(dir.join(format!("{}.tokenizer.json", stem)));
        candidates.push(dir.join(format!("{}.json", stem)));
    }
    candidates.push(dir.join("tokenizer.json"));

    candidates.into_iter().find(|path| path.exists())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CHAT_TOKENIZER: &str = r#"{
        "version":"1.0",
        "truncation":null,
        "padding":null,
        "added_tokens":[
            {"id":3,"content":"<|im_end|>","single_word":false,"lstrip":false,"rstrip":false,"normalized":false,"special":true},
            {"id":4,"content":"<|endoftext|>","single_word":false,"lstrip":false,"rstrip":false,"normalized":false,"special":true}
        ],
        "normalizer":null,
        "pre_tokenizer":{"type":"Whitespace"},
        "post_processor":null,
        "decoder":null,
        "model":{"type":"WordLevel","vocab":{"hello":0,"world":1,"<unk>":2,"<|im_end|>":3,"<|endoftext|>":4},"unk_token":"<unk>"}
    }"#;

    #[test]
    fn test_tokenizer_from_json() {
        let tokenizer = HfTokenizer::from_json(CHAT_TOKENIZER).unwrap();
        let tokens = tokenizer.encode("hello world").unwrap();
        assert_eq!(tokens, vec![0, 1]);
        let text = tokenizer.decode(&tokens).unwrap();
        assert!(text.contains("hello"));
        assert_eq!(tokenizer.vocab_size(), 5);
    }

    #[test]
    fn test_end_tokens() {
        let tokenizer = HfTokenizer::from_json(CHAT_TOKENIZER).unwrap();
        assert_eq!(tokenizer.end_tokens(), &[3, 4]);
        assert!(tokenizer.is_sentence_ending(3));
        assert!(tokenizer.is_sentence_ending(4));
        assert!(!tokenizer.is_sentence_ending(0));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            HfTokenizer::from_json("{not json"),
            Err(ForgeError::TokenizerLoadFailed(_))
        ));
    }

    #[test]
    fn test_missing_tokenizer_file() {
        assert!(HfTokenizer::from_file(Path::new("/nonexistent/tokenizer.json")).is_err());
    }

    #[test]
    fn test_infer_tokenizer_path() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("qwen.bin");
        assert!(infer_tokenizer_path(&model).is_none());
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        assert_eq!(
            infer_tokenizer_path(&model),
            Some(dir.path().join("tokenizer.json"))
        );
    }
}
