// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretability tools built on the SAE.
//!
//! - [`steering`]: feature steering configs, combined steering vectors, and
//!   the hook spec that adds them to the residual stream.
//! - [`features`]: top-k SAE feature extraction and the report type.

pub mod features;
pub mod steering;
