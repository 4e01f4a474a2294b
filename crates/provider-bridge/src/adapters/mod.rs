//! Per-provider request framing and chunk parsing.
//!
//! Each provider family is a variant of [`ProviderFamily`] backed by a unit
//! struct implementing [`ChunkFormat`]. Adding a provider means adding a
//! variant and an adapter, not another branch in the streaming client.

mod anthropic;
mod gemini;
mod openai;

pub use anthropic::AnthropicFormat;
pub use gemini::GeminiFormat;
pub use openai::OpenAiFormat;

use crate::error::ProviderError;
use crate::types::ChatRequest;
use serde::{Deserialize, Serialize};

/// Default completion budget when the caller gives none and the provider
/// requires one.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Request/response shape of one provider family.
pub trait ChunkFormat: Send + Sync {
    /// Translate a neutral request into the provider's JSON body.
    fn format_request(&self, request: &ChatRequest) -> serde_json::Value;

    /// Extract delta text from one SSE `data:` payload.
    ///
    /// `Ok(None)` for chunks that carry no text (role-only, metadata,
    /// keep-alives). `Err(ChunkParse)` for a malformed chunk, which callers
    /// skip. Any other error is a provider-reported failure and ends the
    /// stream.
    fn parse_chunk(&self, raw: &str, model_id: &str) -> Result<Option<String>, ProviderError>;
}

/// Supported provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    /// OpenAI and OpenAI-compatible chat completions.
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
    /// Google Gemini generateContent API.
    Gemini,
}

/// Model id prefix to family. Unknown models are assumed OpenAI-compatible.
const MODEL_FAMILIES: &[(&str, ProviderFamily)] = &[
    ("claude", ProviderFamily::Anthropic),
    ("gemini", ProviderFamily::Gemini),
    ("gpt", ProviderFamily::OpenAi),
    ("o1", ProviderFamily::OpenAi),
    ("o3", ProviderFamily::OpenAi),
];

static OPENAI: OpenAiFormat = OpenAiFormat;
static ANTHROPIC: AnthropicFormat = AnthropicFormat;
static GEMINI: GeminiFormat = GeminiFormat;

impl ProviderFamily {
    pub const ALL: [ProviderFamily; 3] = [
        ProviderFamily::OpenAi,
        ProviderFamily::Anthropic,
        ProviderFamily::Gemini,
    ];

    /// Pick the family serving a model id.
    pub fn for_model(model_id: &str) -> Self {
        let model = model_id.trim().to_lowercase();
        // Strip a vendor namespace such as "anthropic/claude-3-haiku"
        let model = model.rsplit('/').next().unwrap_or(&model);

        MODEL_FAMILIES
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
            .map(|(_, family)| *family)
            .unwrap_or(ProviderFamily::OpenAi)
    }

    /// The adapter implementing this family's wire shape.
    pub fn adapter(&self) -> &'static dyn ChunkFormat {
        match self {
            ProviderFamily::OpenAi => &OPENAI,
            ProviderFamily::Anthropic => &ANTHROPIC,
            ProviderFamily::Gemini => &GEMINI,
        }
    }

    /// Streaming endpoint for a model.
    pub fn endpoint(&self, base_url: &str, model_id: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            ProviderFamily::OpenAi => format!("{}/chat/completions", base),
            ProviderFamily::Anthropic => format!("{}/messages", base),
            ProviderFamily::Gemini => {
                format!("{}/models/{}:streamGenerateContent?alt=sse", base, model_id)
            }
        }
    }

    /// Authentication and version headers.
    pub fn auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        match self {
            ProviderFamily::OpenAi => vec![("Authorization", format!("Bearer {}", api_key))],
            ProviderFamily::Anthropic => vec![
                ("x-api-key", api_key.to_string()),
                ("anthropic-version", "2023-06-01".to_string()),
            ],
            ProviderFamily::Gemini => vec![("x-goog-api-key", api_key.to_string())],
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderFamily::OpenAi => "https://api.openai.com/v1",
            ProviderFamily::Anthropic => "https://api.anthropic.com/v1",
            ProviderFamily::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    /// End-of-stream sentinel some providers send as a data payload.
    pub fn is_done_marker(&self, data: &str) -> bool {
        matches!(self, ProviderFamily::OpenAi) && data.trim() == "[DONE]"
    }
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderFamily::OpenAi => write!(f, "openai"),
            ProviderFamily::Anthropic => write!(f, "anthropic"),
            ProviderFamily::Gemini => write!(f, "gemini"),
        }
    }
}

/// Parse a chunk body as JSON, mapping failures to a skippable error.
fn parse_json(raw: &str, model_id: &str) -> Result<serde_json::Value, ProviderError> {
    serde_json::from_str(raw).map_err(|e| {
        ProviderError::ChunkParse(format!("{} chunk for {}: {}", truncate(raw, 80), model_id, e))
    })
}

/// Provider-reported error object embedded in a chunk, if any.
fn embedded_error(chunk: &serde_json::Value) -> Option<ProviderError> {
    let error = chunk.get("error")?;
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(String::from)
        .unwrap_or_else(|| error.to_string());
    let status = error
        .get("code")
        .and_then(|c| c.as_u64())
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(502);
    Some(ProviderError::Api { status, message })
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
