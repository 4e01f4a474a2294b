//! Gemini generateContent framing.

use super::{embedded_error, parse_json, ChunkFormat};
use crate::error::ProviderError;
use crate::types::{ChatRequest, Role};
use serde_json::{json, Value};

/// Gemini `:streamGenerateContent?alt=sse`.
///
/// The model id is part of the URL, assistant turns use the `model` role and
/// text lives in `parts`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiFormat;

impl ChunkFormat for GeminiFormat {
    fn format_request(&self, request: &ChatRequest) -> Value {
        let contents: Vec<Value> = request
            .conversation()
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut body = json!({ "contents": contents });
        if let Some(system) = request.system_prompt() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let mut generation = serde_json::Map::new();
        if let Some(max_tokens) = request.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        body
    }

    fn parse_chunk(&self, raw: &str, model_id: &str) -> Result<Option<String>, ProviderError> {
        let chunk = parse_json(raw, model_id)?;
        if let Some(err) = embedded_error(&chunk) {
            return Err(err);
        }

        let text: String = chunk
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        Ok((!text.is_empty()).then_some(text))
    }
}
