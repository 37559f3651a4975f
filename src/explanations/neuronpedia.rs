// SPDX-License-Identifier: MIT OR Apache-2.0

//! Neuronpedia explanation-export client.

use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::error::{InterpError, Result};

use super::{ExplanationRecord, ExplanationSource};

/// Default export endpoint.
pub const DEFAULT_EXPORT_URL: &str = "https://www.neuronpedia.org/api/explanation/export";

/// Blocking HTTP client for `GET <export>?modelId=..&saeId=..`.
#[derive(Debug, Clone)]
pub struct NeuronpediaClient {
    client: Client,
    export_url: String,
}

impl NeuronpediaClient {
    /// Client for `export_url` with a whole-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Config`] if the HTTP client cannot be built.
    pub fn new(export_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| InterpError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            export_url: export_url.into(),
        })
    }

    /// Full request URL for one SAE.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Config`] if the export URL does not parse.
    pub fn export_url(&self, model_id: &str, sae_id: &str) -> Result<Url> {
        Url::parse_with_params(&self.export_url, &[("modelId", model_id), ("saeId", sae_id)])
            .map_err(|e| InterpError::Config(format!("export url `{}`: {e}", self.export_url)))
    }
}

impl ExplanationSource for NeuronpediaClient {
    fn fetch(&self, model_id: &str, sae_id: &str) -> Result<Vec<ExplanationRecord>> {
        let url = self.export_url(model_id, sae_id)?;
        let failed = |reason: String| InterpError::ExternalFetchFailed {
            url: url.to_string(),
            reason,
        };
        debug!(%url, "fetching explanation export");

        let response = self
            .client
            .get(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .map_err(|e| failed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(failed(format!("HTTP {status}: {body}")));
        }

        response
            .json::<Vec<ExplanationRecord>>()
            .map_err(|e| failed(format!("invalid export body: {e}")))
    }
}
