// SPDX-License-Identifier: MIT OR Apache-2.0

//! # smol-interp
//!
//! Sparse-autoencoder feature inspection and steering for Gemma 2, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! The Gemma 2 forward pass exposes `TransformerLens`-style hook points;
//! a Gemma Scope `JumpReLU` SAE reads the residual stream at one of them.
//! On top of that, an [`InterpSession`] offers:
//!
//! - **Inference**: logits for every position of a prompt.
//! - **Feature inspection**: the top SAE latents at the final token, with
//!   their Neuronpedia explanations.
//! - **Steered generation**: decoder directions, scaled and summed, added
//!   to the residual stream for the duration of one generation call.
//!   Every generation also reports the top latents at each token.
//! - **Metadata**, **explanation lookup**, and local **feature search**
//!   and random browsing over the cached explanations.
//!
//! [`InterpService`] wraps a session that may not be loaded yet and returns
//! [`InterpError::NotReady`] until it is.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod error;
pub mod explanations;
pub mod generation;
pub mod hooks;
pub mod interp;
pub mod sae;
pub mod service;
pub mod session;
pub mod tokenizer;
pub mod transformer;
pub(crate) mod util;

pub use backend::{GenerationResult, HookScope, HookedBackend, HookedTransformer};
pub use config::TransformerConfig;
pub use error::{InterpError, Result};
pub use explanations::{
    ExplanationRecord, ExplanationSource, ExplanationStore, ExplanationTable, FileStore,
    NeuronpediaClient, SearchFeature, load_or_fetch,
};
pub use generation::{GenerationConfig, Sampler};
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention};
pub use interp::features::{
    FeatureActivation, FeatureExplanation, FeatureReport, TokenExplanation,
};
pub use interp::steering::SteeringConfig;
pub use sae::{SaeConfig, SparseAutoencoder};
pub use service::InterpService;
pub use session::{InferenceOutput, InterpSession, ModelInfo, SessionConfig};
pub use tokenizer::InterpTokenizer;
pub use transformer::Gemma2;
pub use util::masks::clear_mask_cache;
