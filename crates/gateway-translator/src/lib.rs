//! # Gateway Translator
//!
//! Converts between caller/provider wire formats and the unified message
//! model. Every format implements the [`Translator`] contract.
//!
//! - [`openai::OpenAiTranslator`]: chat completions
//! - [`anthropic::AnthropicTranslator`]: messages
//! - [`gemini::GeminiTranslator`]: `generateContent`
//! - [`detect::detect_format`]: structural format sniffing, used by the
//!   HTTP surface to turn away Gemini-shaped bodies
//! - [`transcoder::StreamTranscoder`]: SSE stream re-encoding
//!
//! [`reshape::reshape_payload`] is a library helper for payloads already close
//! to their target format; the proxy path always goes through a full
//! [`Translator`] round trip.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod anthropic;
pub mod detect;
pub mod gemini;
pub mod openai;
pub mod registry;
pub mod reshape;
pub mod sse;
pub mod transcoder;

use bytes::Bytes;
use gateway_core::{
    ApiFormat, GatewayError, GatewayResult, StreamDelta, UnifiedRequest, UnifiedResponse,
};
use serde_json::Value;

pub use anthropic::AnthropicTranslator;
pub use detect::{detect_format, detect_format_bytes};
pub use gemini::GeminiTranslator;
pub use openai::OpenAiTranslator;
pub use registry::TranslatorRegistry;
pub use reshape::reshape_payload;
pub use sse::SseLineBuffer;
pub use transcoder::{check_stream_error, StreamTranscoder};

/// Conversion contract implemented once per wire format
pub trait Translator: Send + Sync {
    /// Format handled by this translator
    fn format(&self) -> ApiFormat;

    /// Parse a raw request body into the unified model
    fn parse_request(&self, body: &[u8]) -> GatewayResult<UnifiedRequest>;

    /// Build a raw request body from the unified model
    fn build_request(&self, request: &UnifiedRequest) -> GatewayResult<Bytes>;

    /// Parse a raw response body into the unified model
    fn parse_response(&self, body: &[u8]) -> GatewayResult<UnifiedResponse>;

    /// Build a raw response body from the unified model
    fn build_response(&self, response: &UnifiedResponse) -> GatewayResult<Bytes>;

    /// Parse every delta contained in one SSE chunk. Malformed fragments are
    /// skipped, never raised.
    fn parse_stream_events(&self, chunk: &str) -> Vec<StreamDelta>;

    /// Parse the first delta of an SSE chunk
    fn parse_stream_chunk(&self, chunk: &str) -> Option<StreamDelta> {
        self.parse_stream_events(chunk).into_iter().next()
    }

    /// Render a delta as SSE text; empty when the format has no equivalent event
    fn build_stream_chunk(&self, delta: &StreamDelta) -> String;
}

pub(crate) fn parse_json(format: ApiFormat, body: &[u8]) -> GatewayResult<Value> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::translation(format, format!("invalid JSON: {e}")))?;
    if !value.is_object() {
        return Err(GatewayError::translation(format, "payload must be a JSON object"));
    }
    Ok(value)
}

pub(crate) fn to_bytes(format: ApiFormat, value: &Value) -> GatewayResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| GatewayError::translation(format, format!("cannot serialize: {e}")))
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

pub(crate) fn u32_field(value: &Value, key: &str) -> Option<u32> {
    value.get(key).and_then(Value::as_u64).map(|v| v as u32)
}

pub(crate) fn f32_field(value: &Value, key: &str) -> Option<f32> {
    value.get(key).and_then(Value::as_f64).map(|v| v as f32)
}

pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Split a `data:` URL into media type and base64 payload
pub(crate) fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64").unwrap_or(meta);
    Some((media_type.to_string(), data.to_string()))
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
