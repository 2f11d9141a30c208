//! Registry of translators keyed by wire format.

use crate::transcoder::StreamTranscoder;
use crate::{AnthropicTranslator, GeminiTranslator, OpenAiTranslator, Translator};
use bytes::Bytes;
use gateway_core::{ApiFormat, GatewayError, GatewayResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Lookup table from [`ApiFormat`] to its translator
#[derive(Clone)]
pub struct TranslatorRegistry {
    translators: HashMap<ApiFormat, Arc<dyn Translator>>,
}

impl std::fmt::Debug for TranslatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorRegistry")
            .field("formats", &self.translators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for TranslatorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TranslatorRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            translators: HashMap::new(),
        }
    }

    /// Create a registry with the OpenAI, Anthropic and Gemini translators
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiTranslator::new()));
        registry.register(Arc::new(AnthropicTranslator::new()));
        registry.register(Arc::new(GeminiTranslator::new()));
        registry
    }

    /// Register (or replace) the translator for its format
    pub fn register(&mut self, translator: Arc<dyn Translator>) {
        self.translators.insert(translator.format(), translator);
    }

    /// Get the translator for a format
    pub fn get(&self, format: ApiFormat) -> GatewayResult<Arc<dyn Translator>> {
        self.translators.get(&format).cloned().ok_or_else(|| {
            GatewayError::dispatch(500, format!("no translator registered for format {format}"))
        })
    }

    /// Convert a request body between formats; the identity when they match
    pub fn translate_request(&self, body: &[u8], from: ApiFormat, to: ApiFormat) -> GatewayResult<Bytes> {
        if from == to {
            return Ok(Bytes::copy_from_slice(body));
        }
        trace!(%from, %to, "Translating request");
        let request = self.get(from)?.parse_request(body)?;
        self.get(to)?.build_request(&request)
    }

    /// Convert a response body between formats; the identity when they match
    pub fn translate_response(&self, body: &[u8], from: ApiFormat, to: ApiFormat) -> GatewayResult<Bytes> {
        if from == to {
            return Ok(Bytes::copy_from_slice(body));
        }
        trace!(%from, %to, "Translating response");
        let response = self.get(from)?.parse_response(body)?;
        self.get(to)?.build_response(&response)
    }

    /// Create a stream transcoder from an upstream format to a caller format
    pub fn transcoder(
        &self,
        upstream: ApiFormat,
        caller: ApiFormat,
        provider: &str,
        model: &str,
    ) -> GatewayResult<StreamTranscoder> {
        Ok(StreamTranscoder::new(
            self.get(upstream)?,
            self.get(caller)?,
            provider,
            model,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_identity_translation_is_byte_exact() {
        let registry = TranslatorRegistry::with_defaults();
        let body = br#"{"model":"gpt-4o",  "messages":[],"x-custom":1}"#;
        let out = registry
            .translate_request(body, ApiFormat::OpenAI, ApiFormat::OpenAI)
            .unwrap();
        assert_eq!(out.as_ref(), body.as_slice());
    }

    #[test]
    fn test_openai_to_anthropic_request() {
        let registry = TranslatorRegistry::with_defaults();
        let body = json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "hi"}
            ]
        });
        let out = registry
            .translate_request(body.to_string().as_bytes(), ApiFormat::OpenAI, ApiFormat::Anthropic)
            .unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["system"], "sys");
        assert_eq!(value["messages"], json!([{"role": "user", "content": "hi"}]));
        assert_eq!(value["max_tokens"], 4096);
    }

    #[test]
    fn test_gemini_to_openai_response() {
        let registry = TranslatorRegistry::with_defaults();
        let body = json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "pong"}]}, "finishReason": "STOP"}],
            "modelVersion": "gemini-1.5-pro"
        });
        let out = registry
            .translate_response(body.to_string().as_bytes(), ApiFormat::Gemini, ApiFormat::OpenAI)
            .unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], "pong");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["object"], "chat.completion");
    }

    #[test]
    fn test_missing_translator() {
        let registry = TranslatorRegistry::new();
        assert!(registry.get(ApiFormat::Gemini).is_err());
        assert!(registry
            .translate_request(b"{}", ApiFormat::OpenAI, ApiFormat::Gemini)
            .is_err());
    }
}
