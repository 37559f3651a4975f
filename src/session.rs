// SPDX-License-Identifier: MIT OR Apache-2.0

//! A loaded model + SAE + explanation table, and every operation on it.
//!
//! [`InterpSession::load`] is the one initialization step; the returned
//! handle is immutable and every operation borrows it.  Steering hooks are
//! installed per call through a [`HookScope`](crate::HookScope) and are gone
//! when the call returns.

use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{GenerationResult, HookScope, HookedTransformer};
use crate::error::{InterpError, Result};
use crate::explanations::{
    self, ExplanationRecord, ExplanationTable, FileStore, NeuronpediaClient, SearchFeature,
    neuronpedia::DEFAULT_EXPORT_URL,
};
use crate::generation::{self, GenerationConfig, Sampler};
use crate::hooks::HookSpec;
use crate::interp::features::{
    self, FeatureActivation, FeatureExplanation, FeatureReport, TokenExplanation,
};
use crate::interp::steering::{self, SteeringConfig};
use crate::sae::SparseAutoencoder;
use crate::tokenizer::InterpTokenizer;

/// Environment variable overriding [`SessionConfig::model_id`].
pub const ENV_MODEL: &str = "SMOL_INTERP_MODEL";
/// Environment variable overriding [`SessionConfig::cache_dir`].
pub const ENV_CACHE_DIR: &str = "SMOL_INTERP_CACHE_DIR";

/// Number of features [`InterpSession::activated_features`] reports by
/// default, and the number kept per token in generation explanations.
pub const DEFAULT_TOP_K: usize = 5;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// What to load and where to cache it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// `HuggingFace` model id.
    pub model_id: String,
    /// SAE release name.
    pub sae_release: String,
    /// SAE id within the release.
    pub sae_id: String,
    /// Directory holding the explanations cache.
    pub cache_dir: PathBuf,
    /// File name of the explanations cache inside `cache_dir`.
    pub explanations_file: String,
    /// Explanation export endpoint.
    pub neuronpedia_url: String,
    /// Whole-request timeout for the export fetch.
    pub request_timeout_secs: u64,
    /// Run on the CPU even when CUDA is available.
    pub force_cpu: bool,
    /// Decoding parameters for generation.
    pub generation: GenerationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_id: "google/gemma-2-2b-it".into(),
            sae_release: "gemma-scope-2b-pt-res-canonical".into(),
            sae_id: "layer_0/width_16k/canonical".into(),
            cache_dir: PathBuf::from("/cache"),
            explanations_file: "neuronpedia_explanations.json".into(),
            neuronpedia_url: DEFAULT_EXPORT_URL.into(),
            request_timeout_secs: 60,
            force_cpu: false,
            generation: GenerationConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file; absent fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Io`] if the file cannot be read and
    /// [`InterpError::Config`] if it is not valid JSON for this type.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text)
            .map_err(|e| InterpError::Config(format!("{}: {e}", path.as_ref().display())))
    }

    /// Apply `SMOL_INTERP_MODEL` / `SMOL_INTERP_CACHE_DIR` when set.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(model_id) = var(ENV_MODEL).filter(|v| !v.is_empty()) {
            self.model_id = model_id;
        }
        if let Some(dir) = var(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
        self
    }

    /// Full path of the explanations cache artifact.
    #[must_use]
    pub fn explanations_path(&self) -> PathBuf {
        self.cache_dir.join(&self.explanations_file)
    }
}

// ---------------------------------------------------------------------------
// Operation outputs
// ---------------------------------------------------------------------------

/// Static facts about the loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// Model id the session was loaded from.
    pub model_name: String,
    /// Number of decoder blocks.
    pub layer_count: usize,
    /// Residual width.
    pub hidden_dimension: usize,
}

/// Logits of a single forward pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceOutput {
    /// Prompt tokens (BOS included).
    pub tokens: Vec<u32>,
    /// `[seq][vocab]` logits.
    pub logits: Vec<Vec<f32>>,
}

// ---------------------------------------------------------------------------
// InterpSession
// ---------------------------------------------------------------------------

/// Immutable handle over everything an operation needs.
pub struct InterpSession {
    model_name: String,
    model: HookedTransformer,
    tokenizer: InterpTokenizer,
    sae: SparseAutoencoder,
    explanations: ExplanationTable,
    generation: GenerationConfig,
}

impl InterpSession {
    /// Acquire model, tokenizer, SAE, and explanations for `config`.
    ///
    /// May write the explanations cache.  Failures are returned, never
    /// retried.
    ///
    /// # Errors
    ///
    /// Propagates download, model, SAE, and explanation-fetch errors.
    pub fn load(config: &SessionConfig) -> Result<Self> {
        info!(model = %config.model_id, "loading session");
        let model = HookedTransformer::from_pretrained(&config.model_id, config.force_cpu)?;
        let tokenizer = InterpTokenizer::from_pretrained(&config.model_id)?;
        let sae = SparseAutoencoder::from_pretrained(
            &config.sae_release,
            &config.sae_id,
            model.device(),
        )?;

        let neuronpedia_id = sae.config().neuronpedia_id.clone().ok_or_else(|| {
            InterpError::Config(format!("SAE `{}` has no Neuronpedia id", config.sae_id))
        })?;
        let store = FileStore::new(config.explanations_path());
        let client = NeuronpediaClient::new(&config.neuronpedia_url, config.request_timeout_secs)?;
        let explanations = explanations::load_or_fetch(&store, &client, &neuronpedia_id)?;

        let session = Self::from_parts(
            config.model_id.clone(),
            model,
            tokenizer,
            sae,
            explanations,
            config.generation.clone(),
        )?;
        info!("session ready");
        Ok(session)
    }

    /// Assemble a session from already-loaded parts.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Sae`] if the SAE input width differs from the
    /// model's hidden size or its hook point is past the last layer.
    pub fn from_parts(
        model_name: String,
        model: HookedTransformer,
        tokenizer: InterpTokenizer,
        sae: SparseAutoencoder,
        explanations: ExplanationTable,
        generation: GenerationConfig,
    ) -> Result<Self> {
        let sae_config = sae.config();
        if sae_config.d_in != model.hidden_size() {
            return Err(InterpError::Sae(format!(
                "SAE d_in {} does not match model hidden size {}",
                sae_config.d_in,
                model.hidden_size()
            )));
        }
        if sae_config
            .hook_point
            .layer()
            .is_some_and(|layer| layer >= model.num_layers())
        {
            return Err(InterpError::Sae(format!(
                "SAE hook `{}` is past the model's {} layers",
                sae_config.hook_point,
                model.num_layers()
            )));
        }

        Ok(Self {
            model_name,
            model,
            tokenizer,
            sae,
            explanations,
            generation,
        })
    }

    /// The loaded model.
    #[must_use]
    pub const fn model(&self) -> &HookedTransformer {
        &self.model
    }

    /// The loaded SAE.
    #[must_use]
    pub const fn sae(&self) -> &SparseAutoencoder {
        &self.sae
    }

    /// The tokenizer.
    #[must_use]
    pub const fn tokenizer(&self) -> &InterpTokenizer {
        &self.tokenizer
    }

    /// Decoding parameters used by generation.
    #[must_use]
    pub const fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }

    /// Model name, layer count, and hidden size.
    #[must_use]
    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model_name: self.model_name.clone(),
            layer_count: self.model.num_layers(),
            hidden_dimension: self.model.hidden_size(),
        }
    }

    /// The cached explanation table.
    #[must_use]
    pub const fn explanations(&self) -> &ExplanationTable {
        &self.explanations
    }

    /// First explanation for feature `index`.
    #[must_use]
    pub fn explanation(&self, index: u32) -> Option<&ExplanationRecord> {
        self.explanations.get(index)
    }

    /// The `top_k` features whose explanations best match `query`.
    ///
    /// Purely local: ranks the cached table, never the network.
    #[must_use]
    pub fn search_features(&self, query: &str, top_k: usize) -> Vec<SearchFeature> {
        let hits = self.explanations.search(query, top_k);
        debug!(query, hits = hits.len(), "feature search");
        hits
    }

    /// Up to `count` distinct explained features, drawn at random.
    ///
    /// `seed` fixes the draw; without one the generation seed is used, and
    /// without that OS entropy.
    #[must_use]
    pub fn random_features(&self, count: usize, seed: Option<u64>) -> Vec<SearchFeature> {
        let mut rng = match seed.or(self.generation.seed) {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.explanations.random(count, &mut rng)
    }

    /// One unhooked forward pass; logits for every position.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Tokenizer`] or [`InterpError::Model`].
    pub fn run_inference(&self, prompt: &str) -> Result<InferenceOutput> {
        let tokens = self.tokens(prompt, true)?;
        let logits = self.model.forward(&self.input(&tokens)?, &HookSpec::new())?.into_output();
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec2()?;
        debug!(positions = logits.len(), "inference done");
        Ok(InferenceOutput { tokens, logits })
    }

    /// Top-`k` SAE features at the final token of `prompt`.
    ///
    /// The forward pass is unmodified; the SAE encodes the activation
    /// captured at its hook point and reconstructs it to report the MSE.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Tokenizer`], [`InterpError::Model`], or
    /// [`InterpError::Hook`] if the SAE hook point was never reached.
    pub fn activated_features(&self, prompt: &str, k: usize) -> Result<FeatureReport> {
        let hook = self.sae.config().hook_point.clone();
        let tokens = self.tokens(prompt, self.sae.config().prepend_bos)?;

        let mut spec = HookSpec::new();
        spec.capture(hook.clone());
        let mut cache = self.model.forward(&self.input(&tokens)?, &spec)?;

        let activation = cache.require(&hook)?.clone();
        let sae_acts = self.sae.encode(&activation)?;
        let reconstruction_mse = features::mse(&self.sae.decode(&sae_acts)?, &activation)?;
        let acts_hook = hook.sae_acts_post();
        cache.store(acts_hook.clone(), sae_acts);

        let top = features::top_k_last_position(cache.require(&acts_hook)?, k)?;
        let features = top
            .into_iter()
            .map(|(feature_index, activation)| FeatureActivation {
                feature_index,
                activation,
                description: self.description(feature_index).map(str::to_owned),
            })
            .collect();

        let last_logits = last_position(cache.output())?;
        let top_token_id = features::top_k(&last_logits.to_vec1::<f32>()?, 1)
            .first()
            .and_then(|&(i, _)| u32::try_from(i).ok())
            .ok_or_else(|| InterpError::Model(candle_core::Error::Msg("empty logits".into())))?;
        let top_token = self.tokenizer.decode(&[top_token_id])?;
        debug!(%hook, top_token_id, reconstruction_mse, "features inspected");

        Ok(FeatureReport {
            tokens,
            top_token_id,
            top_token,
            features,
            reconstruction_mse,
        })
    }

    /// Generate with the combined steering vector added at the SAE hook point.
    ///
    /// An empty `configs` slice adds the zero vector, which matches
    /// [`generate`](Self::generate) exactly under the same seed.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Sae`] for an out-of-range feature, and
    /// tokenizer or model errors from generation.
    pub fn run_with_steering(
        &self,
        prompt: &str,
        configs: &[SteeringConfig],
        max_new_tokens: usize,
    ) -> Result<GenerationResult> {
        debug!(features = configs.len(), max_new_tokens, "steered generation");
        let hooks = steering::steering_hooks(&self.sae, configs)?;
        self.generate_with_hooks(prompt, hooks, max_new_tokens)
    }

    /// Unsteered generation with the same tokenization and decoding.
    ///
    /// # Errors
    ///
    /// Returns tokenizer or model errors.
    pub fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<GenerationResult> {
        self.generate_with_hooks(prompt, HookSpec::new(), max_new_tokens)
    }

    fn generate_with_hooks(
        &self,
        prompt: &str,
        hooks: HookSpec,
        max_new_tokens: usize,
    ) -> Result<GenerationResult> {
        let prompt_tokens = self.tokens(prompt, self.sae.config().prepend_bos)?;
        let mut sampler = Sampler::new(&self.generation);

        let (generated_tokens, all, mut explained) = {
            let scope = self.model.with_hooks(hooks);
            let generated = generation::generate(
                &scope,
                &prompt_tokens,
                max_new_tokens,
                self.model.eos_token_ids(),
                &mut sampler,
            )?;
            let all: Vec<u32> = prompt_tokens.iter().chain(&generated).copied().collect();
            let explained = self.explain_tokens(&scope, &all, DEFAULT_TOP_K)?;
            (generated, all, explained)
        };
        let output_token_explanations = explained.split_off(prompt_tokens.len());

        Ok(GenerationResult {
            prompt: prompt.to_owned(),
            full_text: self.tokenizer.decode(&all)?,
            generated_text: self.tokenizer.decode(&generated_tokens)?,
            total_tokens: all.len(),
            prompt_tokens,
            generated_tokens,
            input_token_explanations: explained,
            output_token_explanations,
        })
    }

    /// One capture pass over `tokens` through `scope`; top-`k` SAE latents
    /// per position.
    ///
    /// The scope's interventions stay active, so a steered run is explained
    /// with the steering vector in the residual stream.
    fn explain_tokens(
        &self,
        scope: &HookScope<'_>,
        tokens: &[u32],
        k: usize,
    ) -> Result<Vec<TokenExplanation>> {
        let hook = self.sae.config().hook_point.clone();
        let mut capture = HookSpec::new();
        capture.capture(hook.clone());

        let cache = scope.forward_with(&self.input(tokens)?, &capture)?;
        let sae_acts = self.sae.encode(cache.require(&hook)?)?;
        let per_position = features::top_k_per_position(&sae_acts, k)?;
        debug!(%hook, positions = per_position.len(), "token explanations");

        tokens
            .iter()
            .zip(per_position)
            .map(|(&id, top)| {
                Ok(TokenExplanation {
                    token: self.tokenizer.decode(&[id])?,
                    features: top
                        .into_iter()
                        .map(|(feature_idx, activation)| FeatureExplanation {
                            feature_idx,
                            activation,
                            explanation: self
                                .description(feature_idx)
                                .unwrap_or_default()
                                .to_owned(),
                        })
                        .collect(),
                })
            })
            .collect()
    }

    fn description(&self, feature_index: usize) -> Option<&str> {
        u32::try_from(feature_index)
            .ok()
            .and_then(|i| self.explanations.get(i))
            .map(|r| r.description.as_str())
    }

    fn tokens(&self, prompt: &str, prepend_bos: bool) -> Result<Vec<u32>> {
        self.tokenizer
            .to_tokens(prompt, prepend_bos, self.model.bos_token_id())
    }

    fn input(&self, tokens: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(tokens, self.model.device())?.unsqueeze(0)?)
    }
}

/// `[vocab]` logits at the last position of `[1, seq, vocab]`.
fn last_position(logits: &Tensor) -> Result<Tensor> {
    let (_, seq_len, _) = logits.dims3()?;
    let last = seq_len
        .checked_sub(1)
        .ok_or_else(|| InterpError::Model(candle_core::Error::Msg("empty sequence".into())))?;
    Ok(logits.get(0)?.get(last)?.to_dtype(DType::F32)?)
}

impl std::fmt::Debug for InterpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpSession")
            .field("model_name", &self.model_name)
            .field("sae", &self.sae)
            .field("explanations", &self.explanations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_name_the_gemma_scope_pair() {
        let config = SessionConfig::default();
        assert_eq!(config.model_id, "google/gemma-2-2b-it");
        assert_eq!(config.sae_release, "gemma-scope-2b-pt-res-canonical");
        assert_eq!(config.sae_id, "layer_0/width_16k/canonical");
        assert_eq!(
            config.explanations_path(),
            PathBuf::from("/cache/neuronpedia_explanations.json")
        );
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"force_cpu": true, "generation": {"seed": 3}}"#).unwrap();

        let config = SessionConfig::from_file(&path).unwrap();
        assert!(config.force_cpu);
        assert_eq!(config.generation.seed, Some(3));
        assert_eq!(config.generation.max_new_tokens, 100);
        assert_eq!(config.request_timeout_secs, 60);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(SessionConfig::from_file(&path), Err(InterpError::Config(_))));
    }

    #[test]
    fn env_overrides_apply_when_set() {
        let config = SessionConfig::default().with_overrides_from(|key| match key {
            ENV_MODEL => Some("google/gemma-2-2b".into()),
            ENV_CACHE_DIR => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.model_id, "google/gemma-2-2b");
        assert_eq!(config.cache_dir, PathBuf::from("/cache"));
    }
}
