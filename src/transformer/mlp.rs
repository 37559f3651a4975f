// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gated GELU-tanh feed-forward block: `down(gelu(gate(x)) * up(x))`.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::TransformerConfig;
use crate::error::Result;

/// Gemma 2 MLP.
pub struct Mlp {
    /// `[hidden_size -> intermediate_size]`.
    gate_proj: Linear,
    /// `[hidden_size -> intermediate_size]`.
    up_proj: Linear,
    /// `[intermediate_size -> hidden_size]`.
    down_proj: Linear,
}

impl Mlp {
    /// Load `gate_proj`, `up_proj`, `down_proj` (no bias).
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`](crate::InterpError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: candle_nn::linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: candle_nn::linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: candle_nn::linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
        })
    }

    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`](crate::InterpError::Model) on tensor failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // `gelu` is candle's tanh approximation, matching `gelu_pytorch_tanh`.
        let gate = self.gate_proj.forward(x)?.gelu()?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}
