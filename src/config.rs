// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gemma 2 configuration parsed from a `HuggingFace` `config.json`.
//!
//! # Usage
//!
//! ```
//! use smol_interp::TransformerConfig;
//!
//! let config_str = r#"{"model_type": "gemma2", "hidden_size": 2304,
//!     "num_hidden_layers": 26, "num_attention_heads": 8,
//!     "num_key_value_heads": 4, "head_dim": 256,
//!     "intermediate_size": 9216, "vocab_size": 256000}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = TransformerConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.num_layers, 26);
//! ```

use serde_json::Value;

use crate::error::{InterpError, Result};

/// Configuration for a Gemma 2 decoder-only transformer.
///
/// Every Gemma 2 checkpoint shares the same architecture axes (Gemma RMS
/// norm with `weight + 1`, four norms per layer, gated GELU-tanh MLP, tied
/// embeddings, alternating sliding-window attention); only the dimensions
/// and the handful of scalars below vary between sizes.
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    // --- Dimensions ----------------------------------------------------------
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of decoder blocks.
    pub num_layers: usize,
    /// Number of query attention heads.
    pub num_attention_heads: usize,
    /// Number of key/value heads (GQA when < `num_attention_heads`).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// MLP intermediate dimension.
    pub intermediate_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,

    // --- Scalars -------------------------------------------------------------
    /// Epsilon for the RMS norms.
    pub norm_eps: f64,
    /// Embedding scale, `sqrt(hidden_size)`.
    pub embedding_scale: f64,
    /// Base frequency for rotary position embeddings.
    pub rope_theta: f64,
    /// Maximum sequence length for position embeddings.
    pub max_position_embeddings: usize,
    /// Attention logit soft-capping: `tanh(scores / cap) * cap` before softmax.
    pub attn_logit_softcapping: Option<f64>,
    /// Final logit soft-capping: `tanh(logits / cap) * cap` after the LM head.
    pub final_logit_softcapping: Option<f64>,
    /// Attention scale is `1/sqrt(query_pre_attn_scalar)`.
    pub query_pre_attn_scalar: f64,
    /// Sliding window size used by the even layers.  `None` disables it.
    pub sliding_window: Option<usize>,

    // --- Special tokens ------------------------------------------------------
    /// Beginning-of-sequence token.
    pub bos_token_id: u32,
    /// Tokens that end generation.
    pub eos_token_ids: Vec<u32>,
}

impl TransformerConfig {
    /// Parse a [`TransformerConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Config`] if `model_type` is missing or not
    /// `gemma2`, or if a required dimension is absent.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| InterpError::Config("missing 'model_type' field".into()))?;
        if model_type != "gemma2" {
            return Err(InterpError::Config(format!(
                "unsupported model_type: '{model_type}' (expected 'gemma2')"
            )));
        }

        let hidden_size = get_usize(config, "hidden_size")?;
        let num_attention_heads = get_usize(config, "num_attention_heads")?;

        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "num_hidden_layers")?,
            num_attention_heads,
            num_kv_heads: get_usize_or(config, "num_key_value_heads", num_attention_heads),
            head_dim: get_head_dim(config, hidden_size, num_attention_heads)?,
            intermediate_size: get_usize(config, "intermediate_size")?,
            vocab_size: get_usize(config, "vocab_size")?,

            norm_eps: get_f64_or(config, "rms_norm_eps", 1e-6),
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            // PROMOTE: sqrt(hidden_size); precision loss negligible for d_model <= 2^52
            embedding_scale: (hidden_size as f64).sqrt(),
            rope_theta: get_f64_or(config, "rope_theta", 10_000.0),
            max_position_embeddings: get_usize_or(config, "max_position_embeddings", 8192),
            attn_logit_softcapping: get_optional_f64(config, "attn_logit_softcapping"),
            final_logit_softcapping: get_optional_f64(config, "final_logit_softcapping"),
            query_pre_attn_scalar: get_f64_or(config, "query_pre_attn_scalar", 256.0),
            sliding_window: get_optional_usize(config, "sliding_window"),

            bos_token_id: get_u32_or(config, "bos_token_id", 2),
            eos_token_ids: get_token_ids(config, "eos_token_id").unwrap_or_else(|| vec![1]),
        })
    }

    /// Whether layer `layer_idx` attends through the sliding window.
    ///
    /// Gemma 2 alternates: even layers are local, odd layers global.
    #[must_use]
    pub fn uses_sliding_window(&self, layer_idx: usize) -> bool {
        self.sliding_window.is_some() && layer_idx.is_multiple_of(2)
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| InterpError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| InterpError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    get_optional_usize(config, key).unwrap_or(default)
}

/// Extract an optional `usize` field, returning `None` if absent or `null`.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract a `u32` field, returning a default if absent.
fn get_u32_or(config: &Value, key: &str, default: u32) -> u32 {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract a token id field that may be a single integer or a list.
fn get_token_ids(config: &Value, key: &str) -> Option<Vec<u32>> {
    match config.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()).map(|v| vec![v]),
        Value::Array(items) => {
            let ids: Vec<u32> = items
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|v| u32::try_from(v).ok())
                .collect();
            (!ids.is_empty()).then_some(ids)
        }
        _ => None,
    }
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract an optional `f64` field, returning `None` if absent or `null`.
fn get_optional_f64(config: &Value, key: &str) -> Option<f64> {
    config.get(key).and_then(Value::as_f64)
}

/// Extract `head_dim`, falling back to `hidden_size / num_attention_heads`.
fn get_head_dim(config: &Value, hidden_size: usize, num_attention_heads: usize) -> Result<usize> {
    if let Some(head_dim) = config.get("head_dim").and_then(Value::as_u64) {
        return usize::try_from(head_dim)
            .map_err(|_| InterpError::Config("head_dim overflows usize".into()));
    }
    if num_attention_heads == 0 {
        return Err(InterpError::Config(
            "num_attention_heads is 0, cannot compute head_dim".into(),
        ));
    }
    Ok(hidden_size / num_attention_heads)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
