// SPDX-License-Identifier: MIT OR Apache-2.0

//! `JumpReLU` sparse autoencoder (Gemma Scope format).
//!
//! ```text
//! pre    = x · W_enc + b_enc
//! f(x)   = relu(pre) * [pre > threshold]
//! x_hat  = f · W_dec + b_dec
//! ```
//!
//! All SAE math runs in F32 regardless of the model's activation dtype.

pub mod directory;

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use hf_hub::{Repo, RepoType, api::sync::Api};
use tracing::info;

use crate::error::{InterpError, Result};
use crate::hooks::HookPoint;

/// Shape and wiring metadata for a loaded SAE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaeConfig {
    /// Input (residual) width.
    pub d_in: usize,
    /// Number of latents.
    pub d_sae: usize,
    /// Hook point the SAE reads from and steering writes to.
    pub hook_point: HookPoint,
    /// Whether prompts must start with BOS.
    pub prepend_bos: bool,
    /// Neuronpedia `<model>/<sae>` id, when the SAE is published there.
    pub neuronpedia_id: Option<String>,
}

/// A loaded `JumpReLU` SAE.
pub struct SparseAutoencoder {
    config: SaeConfig,
    /// `[d_in, d_sae]`
    w_enc: Tensor,
    /// `[d_sae, d_in]`
    w_dec: Tensor,
    /// `[d_sae]`
    b_enc: Tensor,
    /// `[d_in]`
    b_dec: Tensor,
    /// `[d_sae]`
    threshold: Tensor,
}

impl SparseAutoencoder {
    /// Download and load an SAE from the release directory.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Config`] for an unknown release or id,
    /// [`InterpError::Download`] if `params.npz` cannot be fetched, and
    /// [`InterpError::Sae`] if a parameter is missing or mis-shaped.
    pub fn from_pretrained(release: &str, sae_id: &str, device: &Device) -> Result<Self> {
        let entry = directory::lookup(release, sae_id)?;
        info!(release, sae_id, repo = entry.repo_id, "loading SAE");

        let api = Api::new().map_err(|e| InterpError::Download(e.to_string()))?;
        let path = api
            .repo(Repo::new(entry.repo_id.to_owned(), RepoType::Model))
            .get(entry.params_path)
            .map_err(|e| {
                InterpError::Download(format!("{}/{}: {e}", entry.repo_id, entry.params_path))
            })?;

        let mut params: HashMap<String, Tensor> = Tensor::read_npz(&path)?.into_iter().collect();
        let mut take = |name: &str| -> Result<Tensor> {
            let tensor = params
                .remove(name)
                .ok_or_else(|| InterpError::Sae(format!("params.npz has no `{name}`")))?;
            Ok(tensor.to_dtype(DType::F32)?.to_device(device)?)
        };
        let w_enc = take("W_enc")?;
        let w_dec = take("W_dec")?;
        let b_enc = take("b_enc")?;
        let b_dec = take("b_dec")?;
        let threshold = take("threshold")?;

        let (d_in, d_sae) = w_enc.dims2()?;
        let config = SaeConfig {
            d_in,
            d_sae,
            hook_point: entry.hook_point(),
            prepend_bos: entry.prepend_bos,
            neuronpedia_id: Some(entry.neuronpedia_id.to_owned()),
        };
        let sae = Self::from_tensors(config, w_enc, w_dec, b_enc, b_dec, threshold)?;
        info!(d_in, d_sae, hook = %sae.config.hook_point, "SAE loaded");
        Ok(sae)
    }

    /// Build an SAE from in-memory parameters.
    ///
    /// Tensors are converted to F32 and checked against `config`.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Sae`] if any shape disagrees with
    /// `config.d_in` / `config.d_sae`.
    pub fn from_tensors(
        config: SaeConfig,
        w_enc: Tensor,
        w_dec: Tensor,
        b_enc: Tensor,
        b_dec: Tensor,
        threshold: Tensor,
    ) -> Result<Self> {
        let (d_in, d_sae) = (config.d_in, config.d_sae);
        let expect = |name: &str, t: &Tensor, shape: &[usize]| -> Result<()> {
            if t.dims() == shape {
                Ok(())
            } else {
                Err(InterpError::Sae(format!(
                    "{name} has shape {:?}, expected {shape:?}",
                    t.dims()
                )))
            }
        };
        expect("W_enc", &w_enc, &[d_in, d_sae])?;
        expect("W_dec", &w_dec, &[d_sae, d_in])?;
        expect("b_enc", &b_enc, &[d_sae])?;
        expect("b_dec", &b_dec, &[d_in])?;
        expect("threshold", &threshold, &[d_sae])?;

        Ok(Self {
            config,
            w_enc: w_enc.to_dtype(DType::F32)?,
            w_dec: w_dec.to_dtype(DType::F32)?,
            b_enc: b_enc.to_dtype(DType::F32)?,
            b_dec: b_dec.to_dtype(DType::F32)?,
            threshold: threshold.to_dtype(DType::F32)?,
        })
    }

    /// Shape and wiring metadata.
    #[must_use]
    pub const fn config(&self) -> &SaeConfig {
        &self.config
    }

    /// Device the parameters live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.w_dec.device()
    }

    /// Encode activations into latents.
    ///
    /// # Shapes
    /// - `x`: `[..., d_in]`, any dtype
    /// - returns: `[..., d_sae]` in F32
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`] on shape mismatch.
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?.to_device(self.w_enc.device())?;
        let pre = x
            .broadcast_matmul(&self.w_enc)?
            .broadcast_add(&self.b_enc)?;
        let gate = pre.broadcast_gt(&self.threshold)?.to_dtype(DType::F32)?;
        Ok((pre.relu()? * gate)?)
    }

    /// Decode latents back into activation space.
    ///
    /// # Shapes
    /// - `f`: `[..., d_sae]`
    /// - returns: `[..., d_in]` in F32
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`] on shape mismatch.
    pub fn decode(&self, f: &Tensor) -> Result<Tensor> {
        let f = f.to_dtype(DType::F32)?;
        Ok(f.broadcast_matmul(&self.w_dec)?.broadcast_add(&self.b_dec)?)
    }

    /// `decode(encode(x))`.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`] on shape mismatch.
    pub fn reconstruct(&self, x: &Tensor) -> Result<Tensor> {
        self.decode(&self.encode(x)?)
    }

    /// Decoder row for one latent: the direction it writes into the residual.
    ///
    /// # Shapes
    /// - returns: `[d_in]` in F32
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Sae`] if `feature_index >= d_sae`.
    pub fn decoder_direction(&self, feature_index: usize) -> Result<Tensor> {
        if feature_index >= self.config.d_sae {
            return Err(InterpError::Sae(format!(
                "feature index {feature_index} out of range (d_sae = {})",
                self.config.d_sae
            )));
        }
        Ok(self.w_dec.get(feature_index)?)
    }
}

impl std::fmt::Debug for SparseAutoencoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseAutoencoder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(d_in: usize, d_sae: usize) -> SaeConfig {
        SaeConfig {
            d_in,
            d_sae,
            hook_point: HookPoint::ResidPost(0),
            prepend_bos: true,
            neuronpedia_id: None,
        }
    }

    /// Identity-like SAE: latent `i` reads and writes residual dim `i`.
    fn identity_sae(threshold: f32) -> SparseAutoencoder {
        let device = Device::Cpu;
        let eye = Tensor::new(&[[1.0_f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]], &device)
            .unwrap();
        SparseAutoencoder::from_tensors(
            config(3, 3),
            eye.clone(),
            eye,
            Tensor::zeros(3, DType::F32, &device).unwrap(),
            Tensor::zeros(3, DType::F32, &device).unwrap(),
            Tensor::full(threshold, 3, &device).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn jump_relu_zeroes_below_threshold() {
        let sae = identity_sae(0.5);
        let x = Tensor::new(&[[0.4_f32, 0.6, -1.0]], &Device::Cpu).unwrap();
        let f: Vec<Vec<f32>> = sae.encode(&x).unwrap().to_vec2().unwrap();
        assert_eq!(f, vec![vec![0.0, 0.6, 0.0]]);
    }

    #[test]
    fn reconstruct_passes_active_latents_through() {
        let sae = identity_sae(0.0);
        let x = Tensor::new(&[[[1.0_f32, 2.0, -3.0]]], &Device::Cpu).unwrap();
        let x_hat: Vec<f32> = sae.reconstruct(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(x_hat, vec![1.0, 2.0, 0.0]);
    }

    #[test]
    fn decoder_direction_is_a_row() {
        let sae = identity_sae(0.0);
        let row: Vec<f32> = sae.decoder_direction(1).unwrap().to_vec1().unwrap();
        assert_eq!(row, vec![0.0, 1.0, 0.0]);
        assert!(matches!(sae.decoder_direction(3), Err(InterpError::Sae(_))));
    }

    #[test]
    fn from_tensors_rejects_bad_shapes() {
        let device = Device::Cpu;
        let result = SparseAutoencoder::from_tensors(
            config(3, 4),
            Tensor::zeros((4, 3), DType::F32, &device).unwrap(),
            Tensor::zeros((4, 3), DType::F32, &device).unwrap(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
            Tensor::zeros(3, DType::F32, &device).unwrap(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
        );
        assert!(matches!(result, Err(InterpError::Sae(msg)) if msg.starts_with("W_enc")));
    }
}
