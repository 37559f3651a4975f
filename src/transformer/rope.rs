// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotary position embeddings (`RoPE`), non-interleaved (Gemma layout).

use candle_core::{DType, Device, Tensor};

use crate::config::TransformerConfig;
use crate::error::Result;

/// Pre-computed `cos`/`sin` tables, each `[max_position, head_dim / 2]`.
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    /// Build the tables for every position up to `max_position_embeddings`.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`](crate::InterpError::Model) on tensor failures.
    pub fn new(config: &TransformerConfig, device: &Device, dtype: DType) -> Result<Self> {
        let half_dim = config.head_dim / 2;
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::as_conversions
        )]
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / config.rope_theta.powf(2.0 * i as f64 / config.head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let max_position = u32::try_from(config.max_position_embeddings).unwrap_or(u32::MAX);
        let positions = Tensor::arange(0_u32, max_position, device)?
            .to_dtype(DType::F32)?
            .unsqueeze(1)?;

        // [max_position, 1] x [1, half_dim] -> [max_position, half_dim]
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// Rotate queries and keys.
    ///
    /// # Shapes
    /// - `q`: `[batch, n_heads, seq, head_dim]`
    /// - `k`: `[batch, n_kv_heads, seq, head_dim]`
    /// - returns: `(q, k)` with the same shapes
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`](crate::InterpError::Model) if `seq`
    /// exceeds the table length or on tensor failures.
    pub fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, _, seq_len, _) = q.dims4()?;
        let cos = self.cos.narrow(0, 0, seq_len)?.to_dtype(q.dtype())?;
        let sin = self.sin.narrow(0, 0, seq_len)?.to_dtype(q.dtype())?;
        // CONTIGUOUS: the rope kernel requires contiguous inputs
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}
