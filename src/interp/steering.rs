// SPDX-License-Identifier: MIT OR Apache-2.0

//! SAE feature steering.
//!
//! Each [`SteeringConfig`] contributes `max_activation * strength` times the
//! feature's decoder direction.  Contributions are summed into one vector
//! that is added to the SAE's hook point at every position.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{InterpError, Result};
use crate::hooks::{HookSpec, Intervention};
use crate::sae::SparseAutoencoder;

/// One feature to steer towards (or away from, with negative strength).
///
/// ```
/// use smol_interp::SteeringConfig;
///
/// let config: SteeringConfig = "1234:8.5:2".parse().unwrap();
/// assert_eq!(config.feature_index, 1234);
/// assert_eq!(config.to_string(), "1234:8.5:2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SteeringConfig {
    /// SAE latent to steer.
    pub feature_index: usize,
    /// Empirical maximum activation of the latent, used for normalization.
    pub max_activation: f64,
    /// User multiplier.
    pub strength: f64,
}

impl SteeringConfig {
    /// Scale applied to the decoder direction.
    #[must_use]
    pub fn coefficient(&self) -> f64 {
        self.max_activation * self.strength
    }
}

impl fmt::Display for SteeringConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.feature_index, self.max_activation, self.strength)
    }
}

/// Parses `<feature_index>:<max_activation>:<strength>`.
impl FromStr for SteeringConfig {
    type Err = InterpError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |why: String| InterpError::Config(format!("steering config `{s}`: {why}"));
        let mut parts = s.split(':');
        let (Some(feature), Some(max_act), Some(strength), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad("expected <feature>:<max_activation>:<strength>".into()));
        };

        Ok(Self {
            feature_index: feature.trim().parse().map_err(|e| bad(format!("feature: {e}")))?,
            max_activation: max_act.trim().parse().map_err(|e| bad(format!("max_activation: {e}")))?,
            strength: strength.trim().parse().map_err(|e| bad(format!("strength: {e}")))?,
        })
    }
}

/// Sum of `max_activation * strength * W_dec[feature_index]` over `configs`.
///
/// Starts from zeros, so an empty slice yields the zero vector.
///
/// # Shapes
/// - returns: `[d_in]` in F32, on the SAE's device
///
/// # Errors
///
/// Returns [`InterpError::Sae`] if a feature index is out of range.
pub fn build_steering_vector(sae: &SparseAutoencoder, configs: &[SteeringConfig]) -> Result<Tensor> {
    let d_in = sae.config().d_in;
    let mut combined = Tensor::zeros(d_in, DType::F32, sae.device())?;
    for config in configs {
        let direction = sae.decoder_direction(config.feature_index)?;
        combined = (combined + (direction * config.coefficient())?)?;
    }
    Ok(combined)
}

/// Hook spec that adds the combined steering vector at the SAE's hook point.
///
/// The intervention is registered even for an empty `configs`: adding the
/// zero vector leaves activations unchanged.
///
/// # Errors
///
/// Returns [`InterpError::Sae`] if a feature index is out of range.
pub fn steering_hooks(sae: &SparseAutoencoder, configs: &[SteeringConfig]) -> Result<HookSpec> {
    let vector = build_steering_vector(sae, configs)?;
    let mut hooks = HookSpec::new();
    hooks.intervene(sae.config().hook_point.clone(), Intervention::Add(vector));
    Ok(hooks)
}
