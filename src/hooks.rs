// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook points, interventions, and captured activations.
//!
//! [`HookPoint`] names a location in the Gemma 2 forward pass using the
//! `TransformerLens` convention, [`HookSpec`] says what to capture and
//! where to intervene, and [`HookCache`] carries the captured tensors back
//! to the caller.  SAE activations computed from a captured hook point are
//! stored under [`HookPoint::SaeActsPost`], mirroring the
//! `<hook>.hook_sae_acts_post` name used by SAE tooling.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{InterpError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Suffix appended to a hook name for the SAE latents computed there.
const SAE_ACTS_POST_SUFFIX: &str = ".hook_sae_acts_post";

/// Named location in a forward pass where activations can be captured
/// or interventions applied.
///
/// ```
/// use smol_interp::HookPoint;
///
/// let hook = HookPoint::ResidPost(0);
/// assert_eq!(hook.to_string(), "blocks.0.hook_resid_post");
///
/// let acts: HookPoint = "blocks.0.hook_resid_post.hook_sae_acts_post".parse().unwrap();
/// assert_eq!(acts, HookPoint::SaeActsPost(Box::new(hook)));
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After the (scaled) token embedding (`hook_embed`).
    Embed,
    /// Residual stream before layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Query vectors in layer `i` (`blocks.{i}.attn.hook_q`).
    AttnQ(usize),
    /// Key vectors in layer `i` (`blocks.{i}.attn.hook_k`).
    AttnK(usize),
    /// Value vectors in layer `i` (`blocks.{i}.attn.hook_v`).
    AttnV(usize),
    /// Pre-softmax attention scores in layer `i` (`blocks.{i}.attn.hook_scores`).
    AttnScores(usize),
    /// Post-softmax attention pattern in layer `i` (`blocks.{i}.attn.hook_pattern`).
    AttnPattern(usize),
    /// Attention output after the post-attention norm (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between attention and MLP (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP input after the pre-feedforward norm (`blocks.{i}.mlp.hook_pre`).
    MlpPre(usize),
    /// MLP output before the post-feedforward norm (`blocks.{i}.mlp.hook_post`).
    MlpPost(usize),
    /// MLP output after the post-feedforward norm (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream after layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
    /// After the final norm (`hook_final_norm`).
    FinalNorm,
    /// SAE latents for the activation at the wrapped hook point.
    ///
    /// Never produced by the forward pass itself; stored by SAE-aware
    /// callers after encoding a captured activation.
    SaeActsPost(Box<HookPoint>),
    /// Any other name.
    Custom(String),
}

impl HookPoint {
    /// The SAE-latent hook point attached to this one.
    #[must_use]
    pub fn sae_acts_post(&self) -> Self {
        Self::SaeActsPost(Box::new(self.clone()))
    }

    /// Layer index for per-layer hook points.
    #[must_use]
    pub fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::AttnQ(i)
            | Self::AttnK(i)
            | Self::AttnV(i)
            | Self::AttnScores(i)
            | Self::AttnPattern(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::MlpPre(i)
            | Self::MlpPost(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
            Self::SaeActsPost(inner) => inner.layer(),
            Self::Embed | Self::FinalNorm | Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnQ(i) => write!(f, "blocks.{i}.attn.hook_q"),
            Self::AttnK(i) => write!(f, "blocks.{i}.attn.hook_k"),
            Self::AttnV(i) => write!(f, "blocks.{i}.attn.hook_v"),
            Self::AttnScores(i) => write!(f, "blocks.{i}.attn.hook_scores"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpPre(i) => write!(f, "blocks.{i}.mlp.hook_pre"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "hook_final_norm"),
            Self::SaeActsPost(inner) => write!(f, "{inner}{SAE_ACTS_POST_SUFFIX}"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`].
fn parse_hook_string(s: &str) -> HookPoint {
    if let Some(base) = s.strip_suffix(SAE_ACTS_POST_SUFFIX) {
        return parse_hook_string(base).sae_acts_post();
    }

    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_final_norm" => return HookPoint::FinalNorm,
        _ => {}
    }

    let Some((layer, suffix)) = s
        .strip_prefix("blocks.")
        .and_then(|rest| rest.split_once('.'))
        .and_then(|(layer, suffix)| layer.parse::<usize>().ok().map(|l| (l, suffix)))
    else {
        return HookPoint::Custom(s.to_string());
    };

    match suffix {
        "hook_resid_pre" => HookPoint::ResidPre(layer),
        "attn.hook_q" => HookPoint::AttnQ(layer),
        "attn.hook_k" => HookPoint::AttnK(layer),
        "attn.hook_v" => HookPoint::AttnV(layer),
        "attn.hook_scores" => HookPoint::AttnScores(layer),
        "attn.hook_pattern" => HookPoint::AttnPattern(layer),
        "hook_attn_out" => HookPoint::AttnOut(layer),
        "hook_resid_mid" => HookPoint::ResidMid(layer),
        "mlp.hook_pre" => HookPoint::MlpPre(layer),
        "mlp.hook_post" => HookPoint::MlpPost(layer),
        "hook_mlp_out" => HookPoint::MlpOut(layer),
        "hook_resid_post" => HookPoint::ResidPost(layer),
        _ => HookPoint::Custom(s.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// An edit applied to the activation at a hook point.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Add a tensor, broadcast over leading dimensions (residual steering).
    Add(Tensor),
}

/// Apply one [`Intervention`] to an activation.
///
/// Added tensors are cast to the activation's dtype, so an F32 steering
/// vector can be applied to BF16 activations.
///
/// # Errors
///
/// Returns [`InterpError::Model`] on shape or dtype failures.
pub(crate) fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Add(delta) => Ok(tensor.broadcast_add(&delta.to_dtype(tensor.dtype())?)?),
    }
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which interventions to apply.
///
/// An empty spec costs nothing in the forward pass.
///
/// ```
/// use smol_interp::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::ResidPost(0)).capture("blocks.1.hook_resid_post");
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture.
    captures: HashSet<HookPoint>,
    /// Interventions in registration order.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Add every capture and intervention of `other` after this spec's own.
    pub fn extend(&mut self, other: &Self) -> &mut Self {
        self.captures.extend(other.captures.iter().cloned());
        self.interventions.extend(other.interventions.iter().cloned());
        self
    }

    /// Whether `hook` should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Whether this spec has no captures and no interventions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Interventions registered at `hook`, in registration order.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Apply the interventions at `hook`, then capture the result if requested.
    ///
    /// Backends call this at every hook point they expose.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`] if an intervention fails.
    pub(crate) fn run_hook(
        &self,
        hook: &HookPoint,
        mut tensor: Tensor,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        if self.is_empty() {
            return Ok(tensor);
        }
        for intervention in self.interventions_at(hook) {
            tensor = apply_intervention(&tensor, intervention)?;
        }
        if self.is_captured(hook) {
            cache.store(hook.clone(), tensor.clone());
        }
        Ok(tensor)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Output logits of a forward pass plus the captured activations.
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a cache holding `output` and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor or fail.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| InterpError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a tensor under `hook`.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor once the final logits are known.
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "hook_embed"),
            (HookPoint::FinalNorm, "hook_final_norm"),
            (HookPoint::ResidPre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::AttnQ(3), "blocks.3.attn.hook_q"),
            (HookPoint::AttnScores(7), "blocks.7.attn.hook_scores"),
            (HookPoint::AttnPattern(5), "blocks.5.attn.hook_pattern"),
            (HookPoint::ResidMid(11), "blocks.11.hook_resid_mid"),
            (HookPoint::MlpPost(1), "blocks.1.mlp.hook_post"),
            (HookPoint::ResidPost(9), "blocks.9.hook_resid_post"),
            (
                HookPoint::ResidPost(0).sae_acts_post(),
                "blocks.0.hook_resid_post.hook_sae_acts_post",
            ),
        ];

        for (hook, expected) in cases {
            assert_eq!(hook.to_string(), expected, "Display failed for {hook:?}");
            let parsed: HookPoint = expected.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected:?}");
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        let hook: HookPoint = "blocks.x.hook_resid_post".parse().unwrap();
        assert_eq!(hook, HookPoint::Custom("blocks.x.hook_resid_post".to_string()));
        assert_eq!(hook.layer(), None);
    }

    #[test]
    fn sae_hook_keeps_layer() {
        let hook = HookPoint::ResidPost(12).sae_acts_post();
        assert_eq!(hook.layer(), Some(12));
    }

    #[test]
    fn extend_merges_captures_and_interventions() {
        let device = Device::Cpu;
        let delta = Tensor::ones(4, DType::F32, &device).unwrap();

        let mut a = HookSpec::new();
        a.capture(HookPoint::ResidPost(0));
        a.intervene(HookPoint::ResidPost(0), Intervention::Add(delta.clone()));

        let mut b = HookSpec::new();
        b.capture(HookPoint::ResidPost(0)).capture(HookPoint::Embed);
        b.intervene(HookPoint::ResidPost(0), Intervention::Add(delta));

        a.extend(&b);
        assert_eq!(a.num_captures(), 2);
        assert_eq!(a.num_interventions(), 2);
        assert_eq!(a.interventions_at(&HookPoint::ResidPost(0)).count(), 2);
    }

    #[test]
    fn run_hook_intervenes_before_capture() {
        let device = Device::Cpu;
        let x = Tensor::ones((1, 3, 4), DType::F32, &device).unwrap();
        let delta = Tensor::new(&[1.0_f32, 2.0, 3.0, 4.0], &device).unwrap();

        let mut spec = HookSpec::new();
        spec.capture(HookPoint::ResidPost(0))
            .intervene(HookPoint::ResidPost(0), Intervention::Add(delta));

        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, &device).unwrap());
        let out = spec.run_hook(&HookPoint::ResidPost(0), x, &mut cache).unwrap();

        let expected = vec![2.0_f32, 3.0, 4.0, 5.0];
        let rows: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        assert!(rows.iter().all(|row| *row == expected));

        let captured = cache.require(&HookPoint::ResidPost(0)).unwrap();
        assert_eq!(captured.dims(), &[1, 3, 4]);
        assert!(cache.require(&HookPoint::Embed).is_err());
    }

    #[test]
    fn add_casts_to_activation_dtype() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 4), DType::F16, &device).unwrap();
        let delta = Tensor::ones(4, DType::F32, &device).unwrap();
        let out = apply_intervention(&x, &Intervention::Add(delta)).unwrap();
        assert_eq!(out.dtype(), DType::F16);
    }
}
