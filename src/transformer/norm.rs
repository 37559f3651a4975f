// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gemma RMS normalization.

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use crate::error::Result;

/// RMS norm whose learned weight `w` is applied as `(w + 1)`.
///
/// The `+ 1` is folded into `scale` at load time.
pub struct GemmaRmsNorm {
    /// `weight + 1`, kept in F32.
    scale: Tensor,
    /// Epsilon for numerical stability.
    eps: f32,
}

impl GemmaRmsNorm {
    /// Load the norm from a [`VarBuilder`] that provides `"weight"`.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`](crate::InterpError::Model) if the
    /// weight tensor cannot be loaded.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(hidden_size: usize, eps: f64, vb: VarBuilder<'_>) -> Result<Self> {
        let weight = vb.get(hidden_size, "weight")?;
        let scale = (weight.to_dtype(DType::F32)? + 1.0)?;
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let eps = eps as f32;
        Ok(Self { scale, eps })
    }

    /// Normalize over the last dimension.
    ///
    /// # Shapes
    /// - `xs`: `[batch, seq, hidden_size]`
    /// - returns: same shape and dtype as `xs`
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`](crate::InterpError::Model) on tensor failures.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        // PROMOTE: variance of BF16 activations overflows; normalize in F32
        let normed = candle_nn::ops::rms_norm(
            &xs.to_dtype(DType::F32)?.contiguous()?,
            &self.scale,
            self.eps,
        )?;
        Ok(normed.to_dtype(dtype)?)
    }
}
