// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared fixtures: a tiny seeded Gemma 2, a word-level tokenizer, and a
//! small SAE wired to `blocks.0.hook_resid_post`.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    dead_code,
    missing_docs
)]

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smol_interp::{
    ExplanationRecord, ExplanationTable, Gemma2, GenerationConfig, HookPoint, HookedTransformer,
    InterpSession, InterpTokenizer, SaeConfig, SparseAutoencoder, TransformerConfig,
};

pub const HIDDEN: usize = 16;
pub const LAYERS: usize = 2;
pub const HEADS: usize = 4;
pub const KV_HEADS: usize = 2;
pub const HEAD_DIM: usize = 8;
pub const INTERMEDIATE: usize = 32;
pub const D_SAE: usize = 24;

pub const WORDS: &[&str] = &[
    "<pad>", "<eos>", "<bos>", "<unk>", "the", "quick", "brown", "fox", "jumps", "over", "lazy",
    "dog", "a", "cat", "sat", "on", "mat", "and", "ran", "away", "from", "big", "red", "small",
    "bird", "flew", "high", "sky", "green", "tree", "under", "sun",
];

pub const PROMPT: &str = "the quick brown fox jumps over the lazy dog";

pub fn tiny_config() -> TransformerConfig {
    let json = serde_json::json!({
        "model_type": "gemma2",
        "hidden_size": HIDDEN,
        "num_hidden_layers": LAYERS,
        "num_attention_heads": HEADS,
        "num_key_value_heads": KV_HEADS,
        "head_dim": HEAD_DIM,
        "intermediate_size": INTERMEDIATE,
        "vocab_size": WORDS.len(),
        "max_position_embeddings": 256,
        "attn_logit_softcapping": 50.0,
        "final_logit_softcapping": 30.0,
        "query_pre_attn_scalar": HEAD_DIM,
        "sliding_window": 4,
        "bos_token_id": 2,
        "eos_token_id": 1
    });
    TransformerConfig::from_hf_config(&json).unwrap()
}

fn random(rng: &mut StdRng, shape: &[usize], scale: f32) -> Tensor {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-scale..scale)).collect();
    Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
}

/// Gemma 2 weights under `model.*`, drawn from a seeded RNG.
pub fn tiny_weights(config: &TransformerConfig, seed: u64) -> HashMap<String, Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (h, i) = (config.hidden_size, config.intermediate_size);
    let q = config.num_attention_heads * config.head_dim;
    let kv = config.num_kv_heads * config.head_dim;

    let mut w = HashMap::new();
    w.insert(
        "model.embed_tokens.weight".to_owned(),
        random(&mut rng, &[config.vocab_size, h], 0.5),
    );
    for l in 0..config.num_layers {
        let p = format!("model.layers.{l}");
        for norm in [
            "input_layernorm",
            "post_attention_layernorm",
            "pre_feedforward_layernorm",
            "post_feedforward_layernorm",
        ] {
            w.insert(format!("{p}.{norm}.weight"), random(&mut rng, &[h], 0.1));
        }
        w.insert(format!("{p}.self_attn.q_proj.weight"), random(&mut rng, &[q, h], 0.3));
        w.insert(format!("{p}.self_attn.k_proj.weight"), random(&mut rng, &[kv, h], 0.3));
        w.insert(format!("{p}.self_attn.v_proj.weight"), random(&mut rng, &[kv, h], 0.3));
        w.insert(format!("{p}.self_attn.o_proj.weight"), random(&mut rng, &[h, q], 0.3));
        w.insert(format!("{p}.mlp.gate_proj.weight"), random(&mut rng, &[i, h], 0.3));
        w.insert(format!("{p}.mlp.up_proj.weight"), random(&mut rng, &[i, h], 0.3));
        w.insert(format!("{p}.mlp.down_proj.weight"), random(&mut rng, &[h, i], 0.3));
    }
    w.insert("model.norm.weight".to_owned(), random(&mut rng, &[h], 0.1));
    w
}

pub fn tiny_model() -> HookedTransformer {
    let config = tiny_config();
    let device = Device::Cpu;
    let vb = VarBuilder::from_tensors(tiny_weights(&config, 7), DType::F32, &device);
    let model = Gemma2::load(config, &device, DType::F32, vb).unwrap();
    HookedTransformer::new(Box::new(model), device)
}

pub fn tokenizer_json() -> String {
    let vocab: serde_json::Map<String, serde_json::Value> = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| ((*w).to_owned(), serde_json::json!(i)))
        .collect();
    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    })
    .to_string()
}

pub fn tiny_tokenizer() -> InterpTokenizer {
    InterpTokenizer::from_json(&tokenizer_json()).unwrap()
}

pub fn tiny_sae() -> SparseAutoencoder {
    let mut rng = StdRng::seed_from_u64(11);
    let device = Device::Cpu;
    SparseAutoencoder::from_tensors(
        SaeConfig {
            d_in: HIDDEN,
            d_sae: D_SAE,
            hook_point: HookPoint::ResidPost(0),
            prepend_bos: true,
            neuronpedia_id: Some("tiny-gemma/0-test-res".to_owned()),
        },
        random(&mut rng, &[HIDDEN, D_SAE], 0.5),
        random(&mut rng, &[D_SAE, HIDDEN], 0.5),
        Tensor::zeros(D_SAE, DType::F32, &device).unwrap(),
        Tensor::zeros(HIDDEN, DType::F32, &device).unwrap(),
        Tensor::zeros(D_SAE, DType::F32, &device).unwrap(),
    )
    .unwrap()
}

/// One explanation per even feature.
pub fn tiny_explanations() -> ExplanationTable {
    let rows = (0..u32::try_from(D_SAE).unwrap())
        .step_by(2)
        .map(|i| ExplanationRecord::new(i, format!("feature {i}")))
        .collect();
    ExplanationTable::from_records(rows)
}

pub fn seeded_generation(seed: u64) -> GenerationConfig {
    GenerationConfig {
        seed: Some(seed),
        ..GenerationConfig::default()
    }
}

pub fn tiny_session(seed: u64) -> InterpSession {
    InterpSession::from_parts(
        "tiny-gemma".to_owned(),
        tiny_model(),
        tiny_tokenizer(),
        tiny_sae(),
        tiny_explanations(),
        seeded_generation(seed),
    )
    .unwrap()
}
