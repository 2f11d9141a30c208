//! Structural detection of an inbound payload's wire format.

use gateway_core::ApiFormat;
use serde_json::Value;

/// Guess the wire format of a request payload.
///
/// Markers are checked in priority order:
/// 1. `contents` entries carrying `parts` → Gemini
/// 2. `system` or `max_tokens` together with typed `text`/`image` blocks → Anthropic
/// 3. anything else → OpenAI
pub fn detect_format(payload: &Value) -> ApiFormat {
    let has_parts = payload
        .get("contents")
        .and_then(Value::as_array)
        .is_some_and(|contents| contents.iter().any(|c| c.get("parts").is_some()));
    if has_parts {
        return ApiFormat::Gemini;
    }

    let has_anthropic_fields = payload.get("system").is_some() || payload.get("max_tokens").is_some();
    if has_anthropic_fields && has_typed_blocks(payload) {
        return ApiFormat::Anthropic;
    }

    ApiFormat::OpenAI
}

/// Detect the format of raw bytes, defaulting to OpenAI when they are not JSON
pub fn detect_format_bytes(body: &[u8]) -> ApiFormat {
    serde_json::from_slice::<Value>(body)
        .map(|v| detect_format(&v))
        .unwrap_or(ApiFormat::OpenAI)
}

fn has_typed_blocks(payload: &Value) -> bool {
    payload
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("content").and_then(Value::as_array))
        .flatten()
        .any(|block| matches!(block.get("type").and_then(Value::as_str), Some("text" | "image")))
}
