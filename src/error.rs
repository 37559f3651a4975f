// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for smol-interp.

/// Errors that can occur while loading a session or running an operation.
#[derive(Debug, thiserror::Error)]
pub enum InterpError {
    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Model, SAE, or session configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Model or SAE artifact acquisition from the Hub failed.
    #[error("download error: {0}")]
    Download(String),

    /// SAE shape mismatch or out-of-range feature index.
    #[error("sae error: {0}")]
    Sae(String),

    /// An operation was invoked before the session finished loading.
    #[error("session is not ready: call load() first")]
    NotReady,

    /// The feature-explanation export could not be fetched or decoded.
    #[error("failed to fetch explanations from {url}: {reason}")]
    ExternalFetchFailed {
        /// Request URL.
        url: String,
        /// Transport, status, or decoding failure.
        reason: String,
    },

    /// A cache artifact exists but could not be read back.
    #[error("cache error: {0}")]
    Cache(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for smol-interp operations.
pub type Result<T> = std::result::Result<T, InterpError>;
