//! Provider bridge errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Authentication failed")]
    Unauthorized,

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    /// A single chunk could not be understood. Never terminal.
    #[error("Chunk parse error: {0}")]
    ChunkParse(String),

    #[error("No provider configured for model: {0}")]
    UnsupportedModel(String),

    #[error("Provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether opening the stream again might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimit => true,
            ProviderError::Http(e) => e.is_connect() || e.is_timeout(),
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
