//! Anthropic messages framing.

use super::{embedded_error, parse_json, ChunkFormat, DEFAULT_MAX_TOKENS};
use crate::error::ProviderError;
use crate::types::ChatRequest;
use serde_json::{json, Value};

/// Anthropic `/messages` with `stream: true`.
///
/// System messages move to the top-level `system` field and `max_tokens`
/// is mandatory.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicFormat;

impl ChunkFormat for AnthropicFormat {
    fn format_request(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .conversation()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if let Some(system) = request.system_prompt() {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    fn parse_chunk(&self, raw: &str, model_id: &str) -> Result<Option<String>, ProviderError> {
        let chunk = parse_json(raw, model_id)?;

        match chunk.get("type").and_then(|t| t.as_str()) {
            Some("content_block_delta") => {
                let delta = chunk.get("delta");
                let is_text = delta
                    .and_then(|d| d.get("type"))
                    .and_then(|t| t.as_str())
                    .map_or(true, |t| t == "text_delta");
                if !is_text {
                    return Ok(None);
                }
                Ok(delta
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                    .filter(|s| !s.is_empty())
                    .map(String::from))
            }
            Some("error") => Err(embedded_error(&chunk).unwrap_or(ProviderError::Api {
                status: 502,
                message: chunk.to_string(),
            })),
            // message_start, content_block_start/stop, message_delta, ping, ...
            _ => Ok(None),
        }
    }
}
