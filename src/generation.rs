// SPDX-License-Identifier: MIT OR Apache-2.0

//! Autoregressive generation under a [`HookScope`].
//!
//! Every step recomputes the full context (no KV cache), so interventions
//! installed on the scope apply to every position of every step, prompt
//! included.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::HookScope;
use crate::error::{InterpError, Result};

/// Decoding parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Softmax temperature; `<= 0` means greedy decoding.
    pub temperature: f32,
    /// Nucleus threshold in `(0, 1]`; `1.0` disables nucleus filtering.
    pub top_p: f32,
    /// Maximum number of tokens to generate.
    pub max_new_tokens: usize,
    /// RNG seed; `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_new_tokens: 100,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Temperature plus nucleus (top-p) sampler over a seedable RNG.
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Build a sampler from decoding parameters.
    #[must_use]
    pub fn new(config: &GenerationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            rng,
        }
    }

    /// Pick the next token from a `[vocab_size]` logits tensor.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`] if the logits cannot be read or are empty.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        if self.temperature <= 0.0 {
            return argmax(&logits);
        }
        let probs = self.nucleus(&softmax(&logits, self.temperature));
        let r: f32 = self.rng.r#gen();
        pick(&probs, r)
    }

    /// `(token, probability)` pairs kept by the nucleus filter, renormalized.
    ///
    /// Tokens are taken in descending probability until the mass *before*
    /// the next token reaches `top_p`, so at least one token always survives.
    fn nucleus(&self, probs: &[f32]) -> Vec<(u32, f32)> {
        let mut ranked: Vec<(u32, f32)> = (0_u32..).zip(probs.iter().copied()).collect();
        ranked.sort_by(|(ia, a), (ib, b)| b.total_cmp(a).then(ia.cmp(ib)));

        let mut kept = Vec::new();
        let mut mass = 0.0_f32;
        for (idx, p) in ranked {
            if mass >= self.top_p && !kept.is_empty() {
                break;
            }
            mass += p;
            kept.push((idx, p));
        }
        for (_, p) in &mut kept {
            *p /= mass;
        }
        kept
    }
}

/// Numerically stable softmax of `logits / temperature`.
fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = logits
        .iter()
        .map(|x| ((x - max_val) / temperature).exp())
        .collect();
    let sum: f32 = exp_vals.iter().sum();
    exp_vals.into_iter().map(|x| x / sum).collect()
}

/// Greedy (argmax) decoding; ties go to the lowest index.
fn argmax(logits: &[f32]) -> Result<u32> {
    (0_u32..)
        .zip(logits.iter())
        .fold(None, |best: Option<(u32, f32)>, (idx, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((idx, v)),
        })
        .map(|(idx, _)| idx)
        .ok_or_else(|| InterpError::Model(candle_core::Error::Msg("empty logits".into())))
}

/// Inverse-CDF draw from a categorical distribution given `r` in `[0, 1)`.
fn pick(probs: &[(u32, f32)], r: f32) -> Result<u32> {
    let mut cumsum = 0.0;
    for &(idx, p) in probs {
        cumsum += p;
        if r < cumsum {
            return Ok(idx);
        }
    }
    // Floating-point rounding can leave cumsum just below r.
    probs
        .last()
        .map(|&(idx, _)| idx)
        .ok_or_else(|| InterpError::Model(candle_core::Error::Msg("empty logits".into())))
}

// ---------------------------------------------------------------------------
// Generation loop
// ---------------------------------------------------------------------------

/// Generate up to `max_new_tokens` tokens after `prompt_ids`.
///
/// Stops early on any token in `stop_tokens`; the stop token is not
/// returned.  Returns only the generated tokens.
///
/// # Errors
///
/// Returns [`InterpError::Model`] on forward-pass or sampling failures.
pub fn generate(
    scope: &HookScope<'_>,
    prompt_ids: &[u32],
    max_new_tokens: usize,
    stop_tokens: &[u32],
    sampler: &mut Sampler,
) -> Result<Vec<u32>> {
    let device = scope.model().device();
    let mut tokens = prompt_ids.to_vec();

    for step in 0..max_new_tokens {
        let input = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        let logits = scope.forward(&input)?.into_output();
        let last = logits.squeeze(0)?.get(tokens.len() - 1)?;

        let next = sampler.sample(&last)?;
        if stop_tokens.contains(&next) {
            debug!(step, token = next, "stop token");
            break;
        }
        tokens.push(next);
    }

    Ok(tokens.split_off(prompt_ids.len()))
}
