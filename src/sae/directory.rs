// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pretrained SAE releases this crate knows how to fetch.
//!
//! Maps a release name and an SAE id to the Hub repository and file holding
//! the weights, the hook point the SAE was trained on, and the Neuronpedia
//! id its feature explanations are published under.

use crate::error::{InterpError, Result};
use crate::hooks::HookPoint;

/// Where one pretrained SAE lives and how it is wired into the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaeDirectoryEntry {
    /// Release name, e.g. `gemma-scope-2b-pt-res-canonical`.
    pub release: &'static str,
    /// SAE id within the release, e.g. `layer_0/width_16k/canonical`.
    pub sae_id: &'static str,
    /// Hub repository holding the weights.
    pub repo_id: &'static str,
    /// Path of the `params.npz` file inside `repo_id`.
    pub params_path: &'static str,
    /// Residual-stream hook the SAE reads from.
    pub hook_name: &'static str,
    /// `<model>/<sae>` id on Neuronpedia.
    pub neuronpedia_id: &'static str,
    /// Whether prompts must start with BOS.
    pub prepend_bos: bool,
}

impl SaeDirectoryEntry {
    /// Parsed [`HookPoint`] for [`hook_name`](Self::hook_name).
    #[must_use]
    pub fn hook_point(&self) -> HookPoint {
        HookPoint::from(self.hook_name)
    }
}

const GEMMA_SCOPE_2B_RES: &str = "google/gemma-scope-2b-pt-res";
const GEMMA_SCOPE_2B_RES_CANONICAL: &str = "gemma-scope-2b-pt-res-canonical";

/// Known entries.
static DIRECTORY: &[SaeDirectoryEntry] = &[
    SaeDirectoryEntry {
        release: GEMMA_SCOPE_2B_RES_CANONICAL,
        sae_id: "layer_0/width_16k/canonical",
        repo_id: GEMMA_SCOPE_2B_RES,
        params_path: "layer_0/width_16k/average_l0_105/params.npz",
        hook_name: "blocks.0.hook_resid_post",
        neuronpedia_id: "gemma-2-2b/0-gemmascope-res-16k",
        prepend_bos: true,
    },
    SaeDirectoryEntry {
        release: GEMMA_SCOPE_2B_RES_CANONICAL,
        sae_id: "layer_12/width_16k/canonical",
        repo_id: GEMMA_SCOPE_2B_RES,
        params_path: "layer_12/width_16k/average_l0_82/params.npz",
        hook_name: "blocks.12.hook_resid_post",
        neuronpedia_id: "gemma-2-2b/12-gemmascope-res-16k",
        prepend_bos: true,
    },
    SaeDirectoryEntry {
        release: GEMMA_SCOPE_2B_RES_CANONICAL,
        sae_id: "layer_20/width_16k/canonical",
        repo_id: GEMMA_SCOPE_2B_RES,
        params_path: "layer_20/width_16k/average_l0_71/params.npz",
        hook_name: "blocks.20.hook_resid_post",
        neuronpedia_id: "gemma-2-2b/20-gemmascope-res-16k",
        prepend_bos: true,
    },
];

/// Look up `sae_id` within `release`.
///
/// # Errors
///
/// Returns [`InterpError::Config`] if the release or the id is unknown.
pub fn lookup(release: &str, sae_id: &str) -> Result<&'static SaeDirectoryEntry> {
    let mut in_release = DIRECTORY.iter().filter(|e| e.release == release).peekable();
    if in_release.peek().is_none() {
        return Err(InterpError::Config(format!("unknown SAE release `{release}`")));
    }
    in_release
        .find(|e| e.sae_id == sae_id)
        .ok_or_else(|| InterpError::Config(format!("unknown SAE id `{sae_id}` in `{release}`")))
}

/// Every entry of `release`, in directory order.
pub fn entries(release: &str) -> impl Iterator<Item = &'static SaeDirectoryEntry> {
    DIRECTORY.iter().filter(move |e| e.release == release)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn canonical_layer_0() {
        let entry = lookup(GEMMA_SCOPE_2B_RES_CANONICAL, "layer_0/width_16k/canonical").unwrap();
        assert_eq!(entry.repo_id, "google/gemma-scope-2b-pt-res");
        assert_eq!(entry.params_path, "layer_0/width_16k/average_l0_105/params.npz");
        assert_eq!(entry.hook_point(), HookPoint::ResidPost(0));
        assert_eq!(entry.neuronpedia_id, "gemma-2-2b/0-gemmascope-res-16k");
        assert!(entry.prepend_bos);
    }

    #[test]
    fn hook_layer_matches_sae_id() {
        for entry in entries(GEMMA_SCOPE_2B_RES_CANONICAL) {
            let layer = entry.hook_point().layer().unwrap();
            assert!(entry.sae_id.starts_with(&format!("layer_{layer}/")));
        }
    }

    #[test]
    fn unknown_release_and_id_are_config_errors() {
        assert!(matches!(
            lookup("no-such-release", "layer_0/width_16k/canonical"),
            Err(InterpError::Config(_))
        ));
        assert!(matches!(
            lookup(GEMMA_SCOPE_2B_RES_CANONICAL, "layer_99/width_16k/canonical"),
            Err(InterpError::Config(_))
        ));
    }
}
