// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait, model wrapper, and scoped hook installation.
//!
//! [`HookedBackend`] is the trait the Gemma 2 forward pass implements.
//! [`HookedTransformer`] wraps it with device metadata and Hub loading.
//! [`HookScope`] installs a [`HookSpec`] for the lifetime of a borrow: every
//! forward pass issued through the scope applies the hooks, and the hooks
//! are gone once the scope is dropped, whichever way the caller leaves.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::{Repo, RepoType, api::sync::Api};
use tracing::{debug, info};

use crate::config::TransformerConfig;
use crate::error::{InterpError, Result};
use crate::hooks::{HookCache, HookSpec};
use crate::interp::features::TokenExplanation;
use crate::transformer::Gemma2;

// ---------------------------------------------------------------------------
// HookedBackend trait
// ---------------------------------------------------------------------------

/// Interface for model backends with hook-aware forward passes.
///
/// The caller specifies captures and interventions via [`HookSpec`], and the
/// backend returns a [`HookCache`] containing the logits plus any requested
/// activations.
pub trait HookedBackend: Send + Sync {
    /// Number of decoder blocks.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Beginning-of-sequence token.
    fn bos_token_id(&self) -> u32;

    /// Tokens that terminate generation.
    fn eos_token_ids(&self) -> &[u32];

    /// Forward pass with optional hook capture and interventions.
    ///
    /// When `hooks` is empty this must be equivalent to a plain forward pass
    /// with no extra allocations.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing logits at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`] on tensor operation failures.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;
}

// ---------------------------------------------------------------------------
// HookedTransformer
// ---------------------------------------------------------------------------

/// Model wrapper combining a backend with its device.
///
/// Holds no hook state of its own: hooks live in a [`HookScope`] or are
/// passed per call to [`forward`](Self::forward).
pub struct HookedTransformer {
    // TRAIT_OBJECT: tests swap in small randomly initialised backends
    backend: Box<dyn HookedBackend>,
    device: Device,
}

impl HookedTransformer {
    /// Load a Gemma 2 model from the `HuggingFace` Hub (or its local cache).
    ///
    /// # `DType` selection
    ///
    /// - **CUDA**: `BF16`
    /// - **CPU**: `F32`
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Download`] if a file cannot be fetched,
    /// [`InterpError::Config`] if `config.json` is not a Gemma 2 config, or
    /// [`InterpError::Model`] if weight loading fails.
    pub fn from_pretrained(model_id: &str, force_cpu: bool) -> Result<Self> {
        let device = select_device(force_cpu)?;
        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };
        info!(model_id, ?device, ?dtype, "loading model");

        let api = Api::new().map_err(|e| InterpError::Download(e.to_string()))?;
        let repo = api.repo(Repo::new(model_id.to_owned(), RepoType::Model));
        let fetch = |name: &str| -> Result<PathBuf> {
            repo.get(name)
                .map_err(|e| InterpError::Download(format!("{model_id}/{name}: {e}")))
        };

        let config_str = std::fs::read_to_string(fetch("config.json")?)
            .map_err(|e| InterpError::Config(format!("read config.json: {e}")))?;
        let json: serde_json::Value = serde_json::from_str(&config_str)
            .map_err(|e| InterpError::Config(format!("parse config.json: {e}")))?;
        let config = TransformerConfig::from_hf_config(&json)?;
        info!(
            layers = config.num_layers,
            hidden = config.hidden_size,
            heads = config.num_attention_heads,
            kv_heads = config.num_kv_heads,
            vocab = config.vocab_size,
            "parsed config"
        );

        let weights_paths = resolve_safetensors_paths(fetch)?;
        info!(files = weights_paths.len(), "loading weights");
        let vb = create_var_builder(&weights_paths, dtype, &device)?;

        let model = Gemma2::load(config, &device, dtype, vb)?;
        Ok(Self::new(Box::new(model), device))
    }

    /// Wrap an existing backend.
    #[must_use]
    pub fn new(backend: Box<dyn HookedBackend>, device: Device) -> Self {
        Self { backend, device }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Beginning-of-sequence token.
    #[must_use]
    pub fn bos_token_id(&self) -> u32 {
        self.backend.bos_token_id()
    }

    /// Tokens that terminate generation.
    #[must_use]
    pub fn eos_token_ids(&self) -> &[u32] {
        self.backend.eos_token_ids()
    }

    /// Run a forward pass with the given hook specification.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: [`HookCache`] containing logits at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.backend.forward(input_ids, hooks)
    }

    /// Install `hooks` for the lifetime of the returned scope.
    ///
    /// ```no_run
    /// # use smol_interp::{HookedTransformer, HookPoint, HookSpec, Intervention};
    /// # fn demo(model: &HookedTransformer, ids: &candle_core::Tensor, delta: candle_core::Tensor) -> smol_interp::Result<()> {
    /// let mut spec = HookSpec::new();
    /// spec.intervene(HookPoint::ResidPost(0), Intervention::Add(delta));
    /// {
    ///     let scope = model.with_hooks(spec);
    ///     let _steered = scope.forward(ids)?;
    /// } // hooks removed here
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn with_hooks(&self, hooks: HookSpec) -> HookScope<'_> {
        debug!(
            captures = hooks.num_captures(),
            interventions = hooks.num_interventions(),
            "installing hook scope"
        );
        HookScope { model: self, hooks }
    }
}

/// Select CUDA GPU 0 when available, otherwise the CPU.
///
/// # Errors
///
/// Returns [`InterpError::Model`] on device detection failure.
fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}

// ---------------------------------------------------------------------------
// HookScope
// ---------------------------------------------------------------------------

/// Hooks installed on a [`HookedTransformer`] for a bounded region.
///
/// The scope borrows the model, so the model cannot be mutated while hooks
/// are live, and owns the [`HookSpec`], so dropping the scope is the only
/// removal step there is.
pub struct HookScope<'a> {
    model: &'a HookedTransformer,
    hooks: HookSpec,
}

impl HookScope<'_> {
    /// The model the hooks are installed on.
    #[must_use]
    pub const fn model(&self) -> &HookedTransformer {
        self.model
    }

    /// Forward pass with the installed hooks.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward(&self, input_ids: &Tensor) -> Result<HookCache> {
        self.model.forward(input_ids, &self.hooks)
    }

    /// Forward pass with the installed hooks followed by `extra`.
    ///
    /// Adds per-call captures on top of the scope's interventions; the
    /// token-explanation pass after generation reads the SAE hook point
    /// this way so steered runs are explained as they were steered.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward_with(&self, input_ids: &Tensor, extra: &HookSpec) -> Result<HookCache> {
        if extra.is_empty() {
            return self.forward(input_ids);
        }
        let mut merged = self.hooks.clone();
        merged.extend(extra);
        self.model.forward(input_ids, &merged)
    }
}

impl Drop for HookScope<'_> {
    fn drop(&mut self) {
        debug!(
            interventions = self.hooks.num_interventions(),
            "removing hook scope"
        );
    }
}

// ---------------------------------------------------------------------------
// GenerationResult
// ---------------------------------------------------------------------------

/// Output of a text generation run with token-level details.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GenerationResult {
    /// Original prompt text.
    pub prompt: String,
    /// Full output (prompt + generated).
    pub full_text: String,
    /// Only the generated portion.
    pub generated_text: String,
    /// Token IDs from the prompt (including BOS when prepended).
    pub prompt_tokens: Vec<u32>,
    /// Token IDs that were generated.
    pub generated_tokens: Vec<u32>,
    /// Total token count (prompt + generated).
    pub total_tokens: usize,
    /// Top SAE latents at each prompt token, aligned with `prompt_tokens`.
    pub input_token_explanations: Vec<TokenExplanation>,
    /// Top SAE latents at each generated token, aligned with `generated_tokens`.
    pub output_token_explanations: Vec<TokenExplanation>,
}

// ---------------------------------------------------------------------------
// Weight loading helpers (used by from_pretrained)
// ---------------------------------------------------------------------------

/// Index structure for sharded safetensors models.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name to shard filename.
    weight_map: HashMap<String, String>,
}

/// Resolve safetensors file paths through `fetch`.
///
/// Tries `model.safetensors.index.json` first (sharded), falls back to a
/// single `model.safetensors`.
fn resolve_safetensors_paths<F>(fetch: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&str) -> Result<PathBuf>,
{
    let Ok(index_path) = fetch("model.safetensors.index.json") else {
        return Ok(vec![fetch("model.safetensors")?]);
    };

    let index_str = std::fs::read_to_string(&index_path)?;
    let index: SafetensorsIndex = serde_json::from_str(&index_str)
        .map_err(|e| InterpError::Config(format!("parse safetensors index: {e}")))?;

    let mut shard_names: Vec<&String> = index.weight_map.values().collect();
    shard_names.sort();
    shard_names.dedup();
    debug!(shards = shard_names.len(), "model is sharded");

    shard_names.into_iter().map(|name| fetch(name)).collect()
}

/// Create a `VarBuilder` from safetensors file paths.
///
/// With the `mmap` feature the files are memory-mapped; otherwise a single
/// file is read into RAM.
fn create_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Load weights via buffered reading (single-file checkpoints only).
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let [path] = paths else {
        return Err(InterpError::Config(
            "sharded checkpoints require the `mmap` feature".into(),
        ));
    };
    let data = std::fs::read(path)?;
    Ok(VarBuilder::from_buffered_safetensors(data, dtype, device)?)
}

/// Load weights via memory-mapped files.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn single_file_when_no_index() {
        let paths = resolve_safetensors_paths(|name| {
            if name == "model.safetensors" {
                Ok(PathBuf::from("/w/model.safetensors"))
            } else {
                Err(InterpError::Download(format!("{name} missing")))
            }
        })
        .unwrap();
        assert_eq!(paths, vec![PathBuf::from("/w/model.safetensors")]);
    }

    #[test]
    fn sharded_index_dedups_shards() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("model.safetensors.index.json");
        std::fs::write(
            &index_path,
            r#"{"weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();

        let paths = resolve_safetensors_paths(|name| {
            if name == "model.safetensors.index.json" {
                Ok(index_path.clone())
            } else {
                Ok(PathBuf::from(name))
            }
        })
        .unwrap();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("model-00001-of-00002.safetensors"),
                PathBuf::from("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn force_cpu_selects_cpu() {
        assert!(matches!(select_device(true).unwrap(), Device::Cpu));
    }
}
