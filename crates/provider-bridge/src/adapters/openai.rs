//! OpenAI chat completions framing.

use super::{embedded_error, parse_json, ChunkFormat};
use crate::error::ProviderError;
use crate::types::ChatRequest;
use serde_json::{json, Value};

/// OpenAI-compatible `/chat/completions` with `stream: true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiFormat;

impl ChunkFormat for OpenAiFormat {
    fn format_request(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    fn parse_chunk(&self, raw: &str, model_id: &str) -> Result<Option<String>, ProviderError> {
        let chunk = parse_json(raw, model_id)?;
        if let Some(err) = embedded_error(&chunk) {
            return Err(err);
        }

        let content = chunk
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str());

        Ok(content.filter(|s| !s.is_empty()).map(String::from))
    }
}
