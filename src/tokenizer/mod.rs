// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer wrapper over the `HuggingFace` `tokenizers` crate.
//!
//! Encoding never relies on the tokenizer's post-processor for special
//! tokens: BOS is prepended explicitly by [`InterpTokenizer::to_tokens`], so
//! the SAE's `prepend_bos` flag alone decides whether it is present.

use std::path::Path;

use hf_hub::{Repo, RepoType, api::sync::Api};

use crate::error::{InterpError, Result};

/// Tokenizer used for every prompt a session processes.
///
/// # Example
///
/// ```no_run
/// use smol_interp::InterpTokenizer;
///
/// # fn main() -> smol_interp::Result<()> {
/// let tok = InterpTokenizer::from_file("tokenizer.json")?;
/// let ids = tok.to_tokens("the quick brown fox", true, 2)?;
/// assert_eq!(ids.first(), Some(&2));
/// # Ok(())
/// # }
/// ```
pub struct InterpTokenizer {
    inner: Box<tokenizers::Tokenizer>,
}

impl InterpTokenizer {
    /// Fetch `tokenizer.json` for `model_id` from the Hub (or its cache).
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Download`] if the file cannot be fetched and
    /// [`InterpError::Tokenizer`] if it cannot be parsed.
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let api = Api::new().map_err(|e| InterpError::Download(e.to_string()))?;
        let path = api
            .repo(Repo::new(model_id.to_owned(), RepoType::Model))
            .get("tokenizer.json")
            .map_err(|e| InterpError::Download(format!("{model_id}/tokenizer.json: {e}")))?;
        Self::from_file(path)
    }

    /// Load a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            InterpError::Tokenizer(format!(
                "failed to load tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::from_hf(tok))
    }

    /// Parse a tokenizer from its serialized JSON.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Tokenizer`] if the JSON is not a valid tokenizer.
    pub fn from_json(json: &str) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_bytes(json.as_bytes())
            .map_err(|e| InterpError::Tokenizer(format!("failed to parse tokenizer: {e}")))?;
        Ok(Self::from_hf(tok))
    }

    /// Wrap an already-loaded `HuggingFace` tokenizer.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer) -> Self {
        Self {
            inner: Box::new(tokenizer),
        }
    }

    /// Encode text into token IDs without any special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Tokenizer`] if encoding fails.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| InterpError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode a prompt, prepending `bos_token_id` when `prepend_bos` is set.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Tokenizer`] if encoding fails or the result
    /// is empty (an empty sequence cannot be run through the model).
    pub fn to_tokens(&self, text: &str, prepend_bos: bool, bos_token_id: u32) -> Result<Vec<u32>> {
        let raw = self.encode_raw(text)?;
        let ids: Vec<u32> = if prepend_bos {
            std::iter::once(bos_token_id).chain(raw).collect()
        } else {
            raw
        };
        if ids.is_empty() {
            return Err(InterpError::Tokenizer(
                "prompt produced no tokens".into(),
            ));
        }
        Ok(ids)
    }

    /// Decode token IDs back to a string, special tokens included.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| InterpError::Tokenizer(format!("decode failed: {e}")))
    }

    /// Vocabulary size, added tokens included.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl std::fmt::Debug for InterpTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}
