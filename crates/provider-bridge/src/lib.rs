//! Streaming chat bridge for OpenAI, Anthropic and Gemini.
//!
//! Callers build a provider-neutral [`ChatRequest`]; the bridge frames it
//! for the provider serving the model, reads the provider's SSE response and
//! yields plain token deltas. Malformed chunks are skipped, provider-reported
//! errors end the stream.

mod adapters;
mod client;
mod error;
mod provider;
mod sse;
mod types;

pub use adapters::{
    AnthropicFormat, ChunkFormat, GeminiFormat, OpenAiFormat, ProviderFamily, DEFAULT_MAX_TOKENS,
};
pub use client::ProviderClient;
pub use error::ProviderError;
pub use provider::{ChatProvider, ProviderRouter, TokenStream};
pub use sse::SseDecoder;
pub use types::*;
