// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steered generation on a tiny seeded Gemma 2: neutral steering is exact,
//! hooks are scoped to one call even when it fails, and the steering
//! vector is linear.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp,
    missing_docs
)]

mod common;

use candle_core::{DType, Device, Tensor};
use common::{D_SAE, HIDDEN, PROMPT};
use smol_interp::generation::generate;
use smol_interp::interp::steering::{build_steering_vector, steering_hooks};
use smol_interp::{HookPoint, HookSpec, InterpError, Intervention, Sampler, SteeringConfig};

fn steer(feature_index: usize, strength: f64) -> SteeringConfig {
    SteeringConfig {
        feature_index,
        max_activation: 4.0,
        strength,
    }
}

fn input(session: &smol_interp::InterpSession) -> Tensor {
    let ids = session.tokenizer().to_tokens(PROMPT, true, 2).unwrap();
    Tensor::new(ids.as_slice(), &candle_core::Device::Cpu)
        .unwrap()
        .unsqueeze(0)
        .unwrap()
}

fn logits(t: &Tensor) -> Vec<Vec<f32>> {
    t.squeeze(0).unwrap().to_vec2().unwrap()
}

#[test]
fn empty_steering_matches_plain_generation() {
    let session = common::tiny_session(42);
    let steered = session.run_with_steering(PROMPT, &[], 8).unwrap();
    let plain = session.generate(PROMPT, 8).unwrap();
    assert_eq!(steered.generated_tokens, plain.generated_tokens);
    assert_eq!(steered.full_text, plain.full_text);
}

#[test]
fn zero_strength_matches_plain_generation() {
    let session = common::tiny_session(42);
    let steered = session
        .run_with_steering(PROMPT, &[steer(3, 0.0), steer(5, 0.0)], 8)
        .unwrap();
    let plain = session.generate(PROMPT, 8).unwrap();
    assert_eq!(steered.generated_tokens, plain.generated_tokens);
}

#[test]
fn zero_strength_logits_are_bitwise_baseline() {
    let session = common::tiny_session(0);
    let model = session.model();
    let x = input(&session);

    let baseline = logits(model.forward(&x, &HookSpec::new()).unwrap().output());
    let hooks = steering_hooks(session.sae(), &[steer(1, 0.0)]).unwrap();
    let scoped = logits(model.with_hooks(hooks).forward(&x).unwrap().output());
    assert_eq!(baseline, scoped);
}

#[test]
fn strong_steering_changes_logits() {
    let session = common::tiny_session(0);
    let model = session.model();
    let x = input(&session);

    let baseline = logits(model.forward(&x, &HookSpec::new()).unwrap().output());
    let hooks = steering_hooks(session.sae(), &[steer(1, 10.0)]).unwrap();
    let steered = logits(model.with_hooks(hooks).forward(&x).unwrap().output());
    assert_ne!(baseline, steered);
}

#[test]
fn scope_left_by_error_mid_generation_leaves_baseline() {
    let session = common::tiny_session(0);
    let model = session.model();
    let prompt = session.tokenizer().to_tokens(PROMPT, true, 2).unwrap();
    let baseline = session.generate(PROMPT, 6).unwrap();

    // A delta with the wrong width fails inside the first forward pass.
    let mut hooks = steering_hooks(session.sae(), &[steer(2, 20.0)]).unwrap();
    let bad = Tensor::ones(HIDDEN + 1, DType::F32, &Device::Cpu).unwrap();
    hooks.intervene(HookPoint::ResidPost(0), Intervention::Add(bad));
    let failed = {
        let scope = model.with_hooks(hooks);
        let mut sampler = Sampler::new(session.generation_config());
        generate(&scope, &prompt, 6, model.eos_token_ids(), &mut sampler)
    };
    assert!(matches!(failed, Err(InterpError::Model(_))));

    let after = session.generate(PROMPT, 6).unwrap();
    assert_eq!(baseline, after);
}

#[test]
fn failed_steering_leaves_model_untouched() {
    let session = common::tiny_session(9);
    let plain_before = session.generate(PROMPT, 6).unwrap();

    let err = session
        .run_with_steering(PROMPT, &[steer(D_SAE, 1.0)], 6)
        .unwrap_err();
    assert!(matches!(err, InterpError::Sae(_)));

    let plain_after = session.generate(PROMPT, 6).unwrap();
    assert_eq!(plain_before.generated_tokens, plain_after.generated_tokens);
}

#[test]
fn steering_vector_is_linear_in_strength() {
    let sae = common::tiny_sae();
    let one: Vec<f32> = build_steering_vector(&sae, &[steer(4, 1.0)])
        .unwrap()
        .to_vec1()
        .unwrap();
    let three: Vec<f32> = build_steering_vector(&sae, &[steer(4, 3.0)])
        .unwrap()
        .to_vec1()
        .unwrap();
    for (a, b) in one.iter().zip(&three) {
        assert!((a * 3.0 - b).abs() < 1e-5, "{a} * 3 != {b}");
    }
}

#[test]
fn steered_result_reports_token_counts() {
    let session = common::tiny_session(5);
    let result = session.run_with_steering(PROMPT, &[steer(0, 2.0)], 4).unwrap();
    assert!(result.generated_tokens.len() <= 4);
    assert_eq!(
        result.total_tokens,
        result.prompt_tokens.len() + result.generated_tokens.len()
    );
    assert_eq!(result.prompt, PROMPT);
    // BOS is prepended and kept in the decoded full text.
    assert_eq!(result.prompt_tokens.first(), Some(&2));
    assert!(result.full_text.starts_with("<bos>"));
}
