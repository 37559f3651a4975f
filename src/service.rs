// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request/response façade over an optionally loaded [`InterpSession`].
//!
//! Each method is one independently callable operation.  Before
//! [`InterpService::load`] succeeds every operation returns
//! [`InterpError::NotReady`] instead of failing an assertion.

use tracing::info;

use crate::backend::GenerationResult;
use crate::error::{InterpError, Result};
use crate::explanations::{ExplanationRecord, ExplanationTable, SearchFeature};
use crate::interp::features::FeatureReport;
use crate::interp::steering::SteeringConfig;
use crate::session::{InferenceOutput, InterpSession, ModelInfo, SessionConfig};

/// Service instance: configuration plus, once loaded, the session.
#[derive(Debug)]
pub struct InterpService {
    config: SessionConfig,
    session: Option<InterpSession>,
}

impl InterpService {
    /// Unloaded service for `config`.
    #[must_use]
    pub const fn new(config: SessionConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Service wrapping an already-built session.
    #[must_use]
    pub const fn with_session(config: SessionConfig, session: InterpSession) -> Self {
        Self {
            config,
            session: Some(session),
        }
    }

    /// Load the session once; later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Propagates [`InterpSession::load`] errors; the service stays unloaded.
    pub fn load(&mut self) -> Result<()> {
        if self.session.is_none() {
            self.session = Some(InterpSession::load(&self.config)?);
        } else {
            info!("session already loaded");
        }
        Ok(())
    }

    /// Whether [`load`](Self::load) has completed.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.session.is_some()
    }

    /// The configuration this service loads from.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The loaded session.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::NotReady`] before [`load`](Self::load).
    pub fn session(&self) -> Result<&InterpSession> {
        self.session.as_ref().ok_or(InterpError::NotReady)
    }

    /// See [`InterpSession::run_inference`].
    ///
    /// # Errors
    ///
    /// [`InterpError::NotReady`] before load, otherwise the session's errors.
    pub fn run_inference(&self, prompt: &str) -> Result<InferenceOutput> {
        self.session()?.run_inference(prompt)
    }

    /// See [`InterpSession::activated_features`].
    ///
    /// # Errors
    ///
    /// [`InterpError::NotReady`] before load, otherwise the session's errors.
    pub fn activated_features(&self, prompt: &str, k: usize) -> Result<FeatureReport> {
        self.session()?.activated_features(prompt, k)
    }

    /// See [`InterpSession::run_with_steering`].
    ///
    /// # Errors
    ///
    /// [`InterpError::NotReady`] before load, otherwise the session's errors.
    pub fn run_with_steering(
        &self,
        prompt: &str,
        configs: &[SteeringConfig],
        max_new_tokens: usize,
    ) -> Result<GenerationResult> {
        self.session()?.run_with_steering(prompt, configs, max_new_tokens)
    }

    /// See [`InterpSession::generate`].
    ///
    /// # Errors
    ///
    /// [`InterpError::NotReady`] before load, otherwise the session's errors.
    pub fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<GenerationResult> {
        self.session()?.generate(prompt, max_new_tokens)
    }

    /// See [`InterpSession::model_info`].
    ///
    /// # Errors
    ///
    /// [`InterpError::NotReady`] before load.
    pub fn model_info(&self) -> Result<ModelInfo> {
        Ok(self.session()?.model_info())
    }

    /// See [`InterpSession::explanations`].
    ///
    /// # Errors
    ///
    /// [`InterpError::NotReady`] before load.
    pub fn explanations(&self) -> Result<&ExplanationTable> {
        Ok(self.session()?.explanations())
    }

    /// See [`InterpSession::search_features`].
    ///
    /// # Errors
    ///
    /// [`InterpError::NotReady`] before load.
    pub fn search_features(&self, query: &str, top_k: usize) -> Result<Vec<SearchFeature>> {
        Ok(self.session()?.search_features(query, top_k))
    }

    /// See [`InterpSession::random_features`].
    ///
    /// # Errors
    ///
    /// [`InterpError::NotReady`] before load.
    pub fn random_features(&self, count: usize, seed: Option<u64>) -> Result<Vec<SearchFeature>> {
        Ok(self.session()?.random_features(count, seed))
    }

    /// See [`InterpSession::explanation`].
    ///
    /// # Errors
    ///
    /// [`InterpError::NotReady`] before load.
    pub fn explanation(&self, index: u32) -> Result<Option<&ExplanationRecord>> {
        Ok(self.session()?.explanation(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operation_is_not_ready_before_load() {
        let service = InterpService::new(SessionConfig::default());
        assert!(!service.is_ready());
        assert!(matches!(service.run_inference("hi"), Err(InterpError::NotReady)));
        assert!(matches!(service.activated_features("hi", 5), Err(InterpError::NotReady)));
        assert!(matches!(service.run_with_steering("hi", &[], 3), Err(InterpError::NotReady)));
        assert!(matches!(service.generate("hi", 3), Err(InterpError::NotReady)));
        assert!(matches!(service.model_info(), Err(InterpError::NotReady)));
        assert!(matches!(service.explanations(), Err(InterpError::NotReady)));
        assert!(matches!(service.explanation(1), Err(InterpError::NotReady)));
        assert!(matches!(service.search_features("fox", 3), Err(InterpError::NotReady)));
        assert!(matches!(service.random_features(3, Some(0)), Err(InterpError::NotReady)));
    }
}
