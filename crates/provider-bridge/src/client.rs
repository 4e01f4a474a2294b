//! Streaming HTTP client for a single provider family.

use crate::adapters::{ChunkFormat, ProviderFamily};
use crate::error::ProviderError;
use crate::provider::{ChatProvider, TokenStream};
use crate::sse::SseDecoder;
use crate::types::ChatRequest;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Default retry configuration
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 5000;

/// Provider streaming client.
///
/// The API key is stored using `SecretString` to prevent accidental
/// exposure in logs or debug output.
#[derive(Clone)]
pub struct ProviderClient {
    client: Client,
    family: ProviderFamily,
    base_url: String,
    api_key: SecretString,
    max_retries: u32,
}

/// What one decoded SSE payload means for the token stream.
enum Step {
    Token(String),
    Skip,
    Done,
    Fail(ProviderError),
}

impl ProviderClient {
    /// Create a client for `family`.
    ///
    /// `connect_timeout` bounds connection setup only; streams may run as
    /// long as the caller allows.
    pub fn new(
        family: ProviderFamily,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            client,
            family,
            base_url: base_url.into(),
            api_key: SecretString::new(api_key.into()),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Override how often opening the stream is retried.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn family(&self) -> ProviderFamily {
        self.family
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a streaming completion and return its token deltas.
    ///
    /// Opening the stream is retried with exponential backoff on transient
    /// failures. Once tokens have started flowing nothing is retried: a
    /// mid-stream failure is yielded as the final item. Cancelling `cancel`
    /// ends the stream without a further item and drops the connection.
    #[instrument(skip(self, request, cancel), fields(provider = %self.family, model = %request.model))]
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ProviderError> {
        let response = self.open_with_retry(&request, &cancel).await?;

        let family = self.family;
        let adapter = family.adapter();
        let model = request.model;

        let stream = async_stream::stream! {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            'read: loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Provider stream cancelled");
                        break 'read;
                    }
                    next = body.next() => next,
                };

                let payloads = match next {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(e)) => {
                        yield Err(ProviderError::Stream(e.to_string()));
                        break 'read;
                    }
                    None => {
                        if let Some(data) = decoder.finish() {
                            if let Step::Token(text) = decode(family, adapter, &data, &model) {
                                yield Ok(text);
                            }
                        }
                        break 'read;
                    }
                };

                for data in payloads {
                    match decode(family, adapter, &data, &model) {
                        Step::Token(text) => yield Ok(text),
                        Step::Skip => {}
                        Step::Done => break 'read,
                        Step::Fail(e) => {
                            yield Err(e);
                            break 'read;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Open the stream, retrying transient failures.
    async fn open_with_retry(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut backoff_ms = DEFAULT_INITIAL_BACKOFF_MS;
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} after {}ms backoff", attempt, backoff_ms);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = sleep(Duration::from_millis(backoff_ms)) => {}
                }
                // Exponential backoff with cap
                backoff_ms = (backoff_ms * 2).min(DEFAULT_MAX_BACKOFF_MS);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                result = self.open(request) => result,
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!("Opening stream failed (attempt {}): {}", attempt + 1, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(ProviderError::Api {
            status: 0,
            message: "Max retries exceeded".into(),
        }))
    }

    async fn open(&self, request: &ChatRequest) -> Result<reqwest::Response, ProviderError> {
        let url = self.family.endpoint(&self.base_url, &request.model);
        let body = self.family.adapter().format_request(request);

        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        for (name, value) in self.family.auth_headers(self.api_key.expose_secret()) {
            builder = builder.header(name, value);
        }

        let response = builder.json(&body).send().await?;
        if !response.status().is_success() {
            return Err(self.extract_error(response).await);
        }
        Ok(response)
    }

    /// Extract error information from failed response.
    async fn extract_error(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Rate limit exceeded");
                ProviderError::RateLimit
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Authentication failed");
                ProviderError::Unauthorized
            }
            _ => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".into());
                ProviderError::Api {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }
}

fn decode(family: ProviderFamily, adapter: &dyn ChunkFormat, data: &str, model: &str) -> Step {
    if family.is_done_marker(data) {
        return Step::Done;
    }
    match adapter.parse_chunk(data, model) {
        Ok(Some(text)) => Step::Token(text),
        Ok(None) => Step::Skip,
        Err(ProviderError::ChunkParse(reason)) => {
            warn!("Skipping unparseable chunk: {}", reason);
            Step::Skip
        }
        Err(e) => Step::Fail(e),
    }
}

#[async_trait]
impl ChatProvider for ProviderClient {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ProviderError> {
        self.chat_stream(request, cancel).await
    }
}
