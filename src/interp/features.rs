// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-k SAE feature extraction.

use candle_core::{DType, Tensor};
use serde::Serialize;

use crate::error::{InterpError, Result};

/// One SAE latent and how strongly it fired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureActivation {
    /// SAE latent index.
    pub feature_index: usize,
    /// Post-`JumpReLU` activation.
    pub activation: f32,
    /// First cached explanation for the latent, if any.
    pub description: Option<String>,
}

/// Result of inspecting which SAE features a prompt activates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureReport {
    /// Prompt tokens fed to the model (BOS included when prepended).
    pub tokens: Vec<u32>,
    /// Most likely next token according to the model's logits.
    pub top_token_id: u32,
    /// Decoded [`top_token_id`](Self::top_token_id).
    pub top_token: String,
    /// Highest activations at the final position, descending.
    pub features: Vec<FeatureActivation>,
    /// Mean squared error of the SAE reconstruction over all positions.
    pub reconstruction_mse: f32,
}

/// A latent firing on one token, with its explanation text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureExplanation {
    /// SAE latent index.
    pub feature_idx: usize,
    /// Post-`JumpReLU` activation at this token.
    pub activation: f32,
    /// First cached explanation, empty when the latent has none.
    pub explanation: String,
}

/// The strongest latents at one token of a generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenExplanation {
    /// The token, decoded on its own.
    pub token: String,
    /// Top latents at this position, descending.
    pub features: Vec<FeatureExplanation>,
}

/// Indices and values of the `k` largest entries, descending.
///
/// Ties keep the lower index first.  Returns `min(k, values.len())` pairs.
#[must_use]
pub fn top_k(values: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = values.iter().copied().enumerate().collect();
    ranked.sort_by(|(ia, a), (ib, b)| b.total_cmp(a).then(ia.cmp(ib)));
    ranked.truncate(k);
    ranked
}

/// Top-k latents at the last position of `[batch, seq, d_sae]` activations.
///
/// # Errors
///
/// Returns [`InterpError::Sae`] for an empty sequence and
/// [`InterpError::Model`] on tensor failures.
pub fn top_k_last_position(acts: &Tensor, k: usize) -> Result<Vec<(usize, f32)>> {
    let (_, seq_len, _) = acts.dims3()?;
    let last = seq_len
        .checked_sub(1)
        .ok_or_else(|| InterpError::Sae("no positions to inspect".into()))?;
    let values: Vec<f32> = acts.get(0)?.get(last)?.to_dtype(DType::F32)?.to_vec1()?;
    Ok(top_k(&values, k))
}

/// Top-k latents at every position of `[1, seq, d_sae]` activations.
///
/// # Errors
///
/// Returns [`InterpError::Model`] on tensor failures.
pub fn top_k_per_position(acts: &Tensor, k: usize) -> Result<Vec<Vec<(usize, f32)>>> {
    let rows: Vec<Vec<f32>> = acts.get(0)?.to_dtype(DType::F32)?.to_vec2()?;
    Ok(rows.iter().map(|row| top_k(row, k)).collect())
}

/// Mean squared error between two same-shaped tensors, in F32.
///
/// # Errors
///
/// Returns [`InterpError::Model`] on shape mismatch.
pub fn mse(a: &Tensor, b: &Tensor) -> Result<f32> {
    let a = a.to_dtype(DType::F32)?;
    let b = b.to_dtype(DType::F32)?.to_device(a.device())?;
    Ok((a - b)?.sqr()?.mean_all()?.to_scalar::<f32>()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn top_k_sorted_descending() {
        let got = top_k(&[0.1, 3.0, 0.0, 2.5, 7.0, 1.0, 2.5], 5);
        assert_eq!(got, vec![(4, 7.0), (1, 3.0), (3, 2.5), (6, 2.5), (5, 1.0)]);
    }

    #[test]
    fn top_k_fills_with_zeros() {
        // Sparse codes: inactive latents still fill the remaining slots.
        let got = top_k(&[0.0, 0.0, 4.0, 0.0], 3);
        assert_eq!(got, vec![(2, 4.0), (0, 0.0), (1, 0.0)]);
    }

    #[test]
    fn top_k_shorter_than_k() {
        assert_eq!(top_k(&[1.0, 2.0], 5).len(), 2);
    }

    #[test]
    fn last_position_is_used() {
        let acts = Tensor::new(&[[[9.0_f32, 0.0, 0.0], [0.0, 1.0, 2.0]]], &Device::Cpu).unwrap();
        assert_eq!(top_k_last_position(&acts, 2).unwrap(), vec![(2, 2.0), (1, 1.0)]);
    }

    #[test]
    fn every_position_gets_its_own_ranking() {
        let acts = Tensor::new(
            &[[[9.0_f32, 0.0, 1.0], [0.0, 1.0, 2.0], [0.0, 0.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let got = top_k_per_position(&acts, 2).unwrap();
        assert_eq!(
            got,
            vec![
                vec![(0, 9.0), (2, 1.0)],
                vec![(2, 2.0), (1, 1.0)],
                vec![(0, 0.0), (1, 0.0)],
            ]
        );
    }

    #[test]
    fn mse_of_known_difference() {
        let a = Tensor::new(&[1.0_f32, 2.0, 3.0, 4.0], &Device::Cpu).unwrap();
        let b = Tensor::new(&[1.0_f32, 2.0, 3.0, 6.0], &Device::Cpu).unwrap();
        assert_eq!(mse(&a, &b).unwrap(), 1.0);
    }
}
