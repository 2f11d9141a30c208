//! API error responses.
//!
//! Errors are rendered in the envelope of the caller's wire format: OpenAI
//! callers get `{"error": {message, type, code, details}}`, Anthropic callers
//! get `{"type": "error", "error": {type, message}}`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use gateway_core::{ApiFormat, GatewayError};
use serde_json::{json, Value};
use tracing::{error, warn};

/// An error returned to an HTTP caller
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status
    pub status: StatusCode,
    /// Envelope `type`
    pub error_type: &'static str,
    /// Human readable message
    pub message: String,
    /// Machine readable code
    pub code: Option<String>,
    /// Structured details
    pub details: Option<Value>,
    /// Envelope to render
    pub format: ApiFormat,
    /// Seconds the caller should wait before retrying
    pub retry_after: Option<u64>,
}

impl ApiError {
    /// Create an error with an explicit status and type
    pub fn new(status: StatusCode, error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type,
            message: message.into(),
            code: None,
            details: None,
            format: ApiFormat::OpenAI,
            retry_after: None,
        }
    }

    /// 400 invalid request
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    /// 400 invalid request naming the offending field
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::bad_request(message)
            .with_code("invalid_request")
            .with_details(json!({ "field": field }))
    }

    /// 404 not found
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found_error", message)
    }

    /// Render in another envelope
    #[must_use]
    pub fn with_format(mut self, format: ApiFormat) -> Self {
        self.format = format;
        self
    }

    /// Attach a machine readable code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach structured details
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convert a gateway error for a caller speaking `format`
    pub fn from_gateway(error: &GatewayError, format: ApiFormat) -> Self {
        let status =
            StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut api = Self::new(status, error.error_type(), error.to_string()).with_format(format);

        match error.root_cause() {
            GatewayError::Validation { field, code, .. } => {
                api.code = Some(code.clone());
                api.details = field.as_ref().map(|f| json!({ "field": f }));
            }
            GatewayError::Dispatch { details, .. } => api.details = details.clone(),
            GatewayError::Status {
                provider,
                status_code,
                ..
            } => {
                api.code = Some(status_code.to_string());
                api.details = Some(json!({ "provider": provider }));
            }
            GatewayError::CircuitOpen { circuit_id, .. } => {
                api.code = Some("circuit_open".to_string());
                api.details = Some(json!({ "circuit": circuit_id }));
            }
            _ => {}
        }
        api.retry_after = match error.root_cause() {
            GatewayError::CircuitOpen { retry_after_ms, .. } => Some(retry_after_ms.div_ceil(1000)),
            other => other.retry_after().map(|d| d.as_secs().max(1)),
        };
        api
    }

    /// Envelope body for this error
    #[must_use]
    pub fn body(&self) -> Value {
        match self.format {
            ApiFormat::Anthropic => json!({
                "type": "error",
                "error": {
                    "type": self.error_type,
                    "message": self.message,
                }
            }),
            ApiFormat::OpenAI | ApiFormat::Gemini => json!({
                "error": {
                    "message": self.message,
                    "type": self.error_type,
                    "code": self.code,
                    "details": self.details,
                }
            }),
        }
    }

    /// The error as a server-sent event in the caller's stream dialect
    #[must_use]
    pub fn sse_event(&self) -> Bytes {
        let body = self.body();
        let event = match self.format {
            ApiFormat::Anthropic => format!("event: error\ndata: {body}\n\n"),
            ApiFormat::OpenAI | ApiFormat::Gemini => format!("data: {body}\n\ndata: [DONE]\n\n"),
        };
        Bytes::from(event)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), error_type = self.error_type, message = %self.message, "Request failed");
        } else {
            warn!(status = self.status.as_u16(), error_type = self.error_type, message = %self.message, "Request rejected");
        }

        let mut response = (self.status, Json(self.body())).into_response();
        if let Some(seconds) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self::from_gateway(&error, ApiFormat::OpenAI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_openai_envelope() {
        let error = GatewayError::validation("model is required", Some("model".into()), "missing_field");
        let api = ApiError::from_gateway(&error, ApiFormat::OpenAI);
        assert_eq!(api.status, StatusCode::BAD_REQUEST);

        let body = api.body();
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], "missing_field");
        assert_eq!(body["error"]["details"]["field"], "model");
        assert_eq!(body["error"]["message"], "model is required");
    }

    #[test]
    fn test_anthropic_envelope() {
        let error = GatewayError::status("anthropic", 429, "slow down");
        let body = ApiError::from_gateway(&error, ApiFormat::Anthropic).body();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert!(body.get("code").is_none());
    }

    #[test]
    fn test_retry_exhaustion_keeps_upstream_status() {
        let error = GatewayError::RetryExhausted {
            attempts: 3,
            last_error: Box::new(GatewayError::status("openai", 503, "busy")),
        };
        let api = ApiError::from_gateway(&error, ApiFormat::OpenAI);
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.code.as_deref(), Some("503"));
    }

    #[test]
    fn test_retry_after_header() {
        let error = GatewayError::Status {
            provider: "openai".into(),
            status_code: 429,
            message: "later".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        let response = ApiError::from_gateway(&error, ApiFormat::OpenAI).into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }

    #[test]
    fn test_sse_events() {
        let error = GatewayError::status("gemini", 500, "boom");
        let anthropic = ApiError::from_gateway(&error, ApiFormat::Anthropic).sse_event();
        assert!(anthropic.starts_with(b"event: error\n"));

        let openai = ApiError::from_gateway(&error, ApiFormat::OpenAI).sse_event();
        assert!(openai.ends_with(b"data: [DONE]\n\n"));
    }
}
