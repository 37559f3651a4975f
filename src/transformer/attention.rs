// SPDX-License-Identifier: MIT OR Apache-2.0

//! Grouped-query self-attention with soft-capping and hook points.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::TransformerConfig;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};

use super::rope::RotaryEmbedding;

/// Self-attention block of one Gemma 2 layer.
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_attention_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    /// `1/sqrt(query_pre_attn_scalar)`.
    scale: f64,
    /// Attention logit soft-capping value.
    softcap: Option<f64>,
}

impl Attention {
    /// Load `q_proj`, `k_proj`, `v_proj`, `o_proj` (no bias).
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`](crate::InterpError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let q_dim = config.num_attention_heads * config.head_dim;
        let kv_dim = config.num_kv_heads * config.head_dim;

        Ok(Self {
            q_proj: candle_nn::linear_no_bias(hidden, q_dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear_no_bias(hidden, kv_dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear_no_bias(hidden, kv_dim, vb.pp("v_proj"))?,
            o_proj: candle_nn::linear_no_bias(q_dim, hidden, vb.pp("o_proj"))?,
            num_attention_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            scale: 1.0 / config.query_pre_attn_scalar.sqrt(),
            softcap: config.attn_logit_softcapping,
        })
    }

    /// Run attention, exposing Q/K/V, scores, and pattern hook points.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - `mask`: `[1, 1, seq, seq]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`](crate::InterpError::Model) on tensor failures.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        rotary: &RotaryEmbedding,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        // [batch, seq, heads * head_dim] -> [batch, heads, seq, head_dim]
        let split_heads = |t: Tensor, heads: usize| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, heads, self.head_dim))?
                .transpose(1, 2)?)
        };
        let q = split_heads(self.q_proj.forward(x)?, self.num_attention_heads)?;
        let k = split_heads(self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = split_heads(self.v_proj.forward(x)?, self.num_kv_heads)?;

        let q = hooks.run_hook(&HookPoint::AttnQ(layer_idx), q, cache)?;
        let k = hooks.run_hook(&HookPoint::AttnK(layer_idx), k, cache)?;
        let v = hooks.run_hook(&HookPoint::AttnV(layer_idx), v, cache)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let k = repeat_kv(k, self.num_attention_heads / self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_attention_heads / self.num_kv_heads)?;

        // CONTIGUOUS: matmul requires contiguous layout after transpose
        let mut scores = (q.contiguous()?.matmul(&k.contiguous()?.t()?)? * self.scale)?;
        if let Some(cap) = self.softcap {
            scores = ((scores / cap)?.tanh()? * cap)?;
        }
        scores = scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?;
        let scores = hooks.run_hook(&HookPoint::AttnScores(layer_idx), scores, cache)?;

        // PROMOTE: softmax over BF16 can produce NaN; compute in F32
        let dtype = scores.dtype();
        let pattern =
            candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
        let pattern = hooks.run_hook(&HookPoint::AttnPattern(layer_idx), pattern, cache)?;

        let out = pattern.matmul(&v.contiguous()?)?;
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_attention_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

/// Expand `[batch, n_kv_heads, seq, head_dim]` to `n_kv_heads * n_rep` heads.
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep <= 1 {
        return Ok(x);
    }
    let (batch, n_kv_heads, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((batch, n_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, n_kv_heads * n_rep, seq_len, head_dim))?)
}
