// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gemma 2 decoder with `TransformerLens`-style hook points.
//!
//! Per layer:
//!
//! ```text
//! resid_pre -> norm -> attn -> post_attn_norm (attn_out) -> + (resid_mid)
//!           -> pre_ff_norm (mlp.hook_pre) -> mlp (mlp.hook_post)
//!           -> post_ff_norm (mlp_out) -> + (resid_post)
//! ```

pub(crate) mod attention;
pub(crate) mod mlp;
pub(crate) mod norm;
pub(crate) mod rope;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use crate::backend::HookedBackend;
use crate::config::TransformerConfig;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::util::masks;

use self::attention::Attention;
use self::mlp::Mlp;
use self::norm::GemmaRmsNorm;
use self::rope::RotaryEmbedding;

/// One decoder block (four norms, Gemma 2 layout).
struct DecoderLayer {
    input_norm: GemmaRmsNorm,
    attention: Attention,
    post_attention_norm: GemmaRmsNorm,
    pre_feedforward_norm: GemmaRmsNorm,
    mlp: Mlp,
    post_feedforward_norm: GemmaRmsNorm,
}

impl DecoderLayer {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let norm = |name: &str| GemmaRmsNorm::load(config.hidden_size, config.norm_eps, vb.pp(name));
        Ok(Self {
            input_norm: norm("input_layernorm")?,
            attention: Attention::load(config, vb.pp("self_attn"))?,
            post_attention_norm: norm("post_attention_layernorm")?,
            pre_feedforward_norm: norm("pre_feedforward_layernorm")?,
            mlp: Mlp::load(config, vb.pp("mlp"))?,
            post_feedforward_norm: norm("post_feedforward_layernorm")?,
        })
    }
}

/// Gemma 2 model with hook capture and intervention at every hook point.
pub struct Gemma2 {
    /// Token embedding, also the (tied) unembedding.
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    final_norm: GemmaRmsNorm,
    rotary: RotaryEmbedding,
    config: TransformerConfig,
    /// Activation dtype the weights were loaded in.
    dtype: DType,
}

impl Gemma2 {
    /// Load every weight under `model.*` and pre-compute the rotary tables.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Model`](crate::InterpError::Model) if a weight
    /// is missing or has the wrong shape.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        config: TransformerConfig,
        device: &Device,
        dtype: DType,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let vb = vb.pp("model");
        let embed_tokens =
            candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let layers = (0..config.num_layers)
            .map(|i| DecoderLayer::load(&config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = GemmaRmsNorm::load(config.hidden_size, config.norm_eps, vb.pp("norm"))?;
        let rotary = RotaryEmbedding::new(&config, device, dtype)?;

        Ok(Self {
            embed_tokens,
            layers,
            final_norm,
            rotary,
            config,
            dtype,
        })
    }

    /// The parsed model configuration.
    #[must_use]
    pub const fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Tied unembedding followed by final logit soft-capping.
    ///
    /// # Shapes
    /// - `hidden`: `[..., hidden_size]`
    /// - returns: `[..., vocab_size]`
    fn unembed(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = hidden.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?;
        match self.config.final_logit_softcapping {
            Some(cap) => Ok(((logits / cap)?.tanh()? * cap)?),
            None => Ok(logits),
        }
    }

    fn mask_for_layer(&self, layer_idx: usize, seq_len: usize, device: &Device) -> Result<Tensor> {
        match self.config.sliding_window {
            Some(window) if self.config.uses_sliding_window(layer_idx) => {
                masks::create_sliding_window_mask(seq_len, window, device, self.dtype)
            }
            _ => masks::create_causal_mask(seq_len, device, self.dtype),
        }
    }
}

impl HookedBackend for Gemma2 {
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn bos_token_id(&self) -> u32 {
        self.config.bos_token_id
    }

    fn eos_token_ids(&self) -> &[u32] {
        &self.config.eos_token_ids
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let device = input_ids.device();
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, device)?);

        let hidden = (self.embed_tokens.forward(input_ids)? * self.config.embedding_scale)?;
        let mut hidden = hooks.run_hook(&HookPoint::Embed, hidden, &mut cache)?;
        let (_, seq_len, _) = hidden.dims3()?;

        for (i, layer) in self.layers.iter().enumerate() {
            let resid_pre = hooks.run_hook(&HookPoint::ResidPre(i), hidden, &mut cache)?;

            let mask = self.mask_for_layer(i, seq_len, device)?;
            let attn = layer.attention.forward(
                &layer.input_norm.forward(&resid_pre)?,
                &mask,
                &self.rotary,
                i,
                hooks,
                &mut cache,
            )?;
            let attn = layer.post_attention_norm.forward(&attn)?;
            let attn = hooks.run_hook(&HookPoint::AttnOut(i), attn, &mut cache)?;

            let resid_mid = hooks.run_hook(&HookPoint::ResidMid(i), (resid_pre + attn)?, &mut cache)?;

            let mlp_in = layer.pre_feedforward_norm.forward(&resid_mid)?;
            let mlp_in = hooks.run_hook(&HookPoint::MlpPre(i), mlp_in, &mut cache)?;
            let mlp = hooks.run_hook(&HookPoint::MlpPost(i), layer.mlp.forward(&mlp_in)?, &mut cache)?;
            let mlp = layer.post_feedforward_norm.forward(&mlp)?;
            let mlp = hooks.run_hook(&HookPoint::MlpOut(i), mlp, &mut cache)?;

            hidden = hooks.run_hook(&HookPoint::ResidPost(i), (resid_mid + mlp)?, &mut cache)?;
        }

        let hidden = hooks.run_hook(
            &HookPoint::FinalNorm,
            self.final_norm.forward(&hidden)?,
            &mut cache,
        )?;
        cache.set_output(self.unembed(&hidden)?);
        Ok(cache)
    }
}
