//! HTTP executor for the supported upstream wire formats.
//!
//! # Endpoints
//! - OpenAI: `{base}/v1/chat/completions`, bearer auth
//! - Anthropic: `{base}/v1/messages`, `x-api-key` plus `anthropic-version`
//! - Gemini: `{base}/v1beta/models/{MODEL}:generateContent`, or
//!   `:streamGenerateContent?alt=sse` when streaming, `x-goog-api-key`
//!
//! The payload is forwarded untouched; it is already in the upstream format.

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use gateway_core::{
    ApiFormat, ChunkStream, ExecutorRequest, GatewayError, GatewayResult, NetworkErrorKind,
    ProviderExecutor,
};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Anthropic API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default upstream base URL for a wire format
#[must_use]
pub fn default_base_url(format: ApiFormat) -> &'static str {
    match format {
        ApiFormat::OpenAI => "https://api.openai.com",
        ApiFormat::Anthropic => "https://api.anthropic.com",
        ApiFormat::Gemini => "https://generativelanguage.googleapis.com",
    }
}

/// reqwest-backed executor for one provider id
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    id: String,
    format: ApiFormat,
    base_url: String,
    models: Vec<String>,
    client: Client,
}

impl HttpExecutor {
    /// Create an executor with the format's default base URL
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(id: impl Into<String>, format: ApiFormat) -> GatewayResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(100)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            id: id.into(),
            format,
            base_url: default_base_url(format).to_string(),
            models: Vec::new(),
            client,
        })
    }

    /// Override the upstream base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the advertised models
    #[must_use]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    /// Base URL used when the credential carries no override
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the endpoint URL.
    ///
    /// A base that already ends in the version segment (`/v1`, `/v1beta`) is
    /// not given a second one.
    fn endpoint_url(&self, base: &str, model: &str, stream: bool) -> String {
        let base = base.trim_end_matches('/');
        match self.format {
            ApiFormat::OpenAI => join_versioned(base, "v1", "chat/completions"),
            ApiFormat::Anthropic => join_versioned(base, "v1", "messages"),
            ApiFormat::Gemini => {
                let action = if stream {
                    "streamGenerateContent?alt=sse"
                } else {
                    "generateContent"
                };
                join_versioned(base, "v1beta", &format!("models/{model}:{action}"))
            }
        }
    }

    fn build_request(&self, request: &ExecutorRequest) -> RequestBuilder {
        let base = request
            .credential
            .base_url
            .as_deref()
            .unwrap_or(&self.base_url);
        let url = self.endpoint_url(base, &request.model, request.stream);
        let key = request.credential.api_key.expose_secret();

        debug!(
            provider = %self.id,
            model = %request.model,
            request_id = %request.request_id,
            stream = request.stream,
            url = %url,
            "Sending upstream request"
        );

        let builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("x-request-id", request.request_id.as_str())
            .body(request.payload.clone());

        match self.format {
            ApiFormat::OpenAI => builder.bearer_auth(key),
            ApiFormat::Anthropic => builder
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            ApiFormat::Gemini => builder.header("x-goog-api-key", key),
        }
    }

    /// Send the request, racing the caller's cancellation token
    async fn send(&self, request: &ExecutorRequest) -> GatewayResult<Response> {
        let pending = self.build_request(request).send();
        let response = tokio::select! {
            result = pending => result.map_err(|e| {
                error!(provider = %self.id, error = %e, "Upstream request failed");
                map_transport_error(&e)
            })?,
            () = request.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        trace!(provider = %self.id, status = %status, body = %body, "Upstream error body");
        Err(GatewayError::Status {
            provider: self.id.clone(),
            status_code: status.as_u16(),
            message: body,
            retry_after,
        })
    }
}

fn join_versioned(base: &str, version: &str, path: &str) -> String {
    if base.ends_with(&format!("/{version}")) {
        format!("{base}/{path}")
    } else {
        format!("{base}/{version}/{path}")
    }
}

/// `Retry-After` in delta-seconds form
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Classify a reqwest failure into a network error kind
fn map_transport_error(e: &reqwest::Error) -> GatewayError {
    let text = format!("{e:?}").to_ascii_lowercase();
    let kind = if e.is_timeout() {
        NetworkErrorKind::Timeout
    } else if text.contains("dns") || text.contains("resolve") {
        NetworkErrorKind::Dns
    } else if text.contains("reset") || text.contains("broken pipe") {
        NetworkErrorKind::ConnectionReset
    } else if e.is_connect() {
        NetworkErrorKind::ConnectionRefused
    } else {
        NetworkErrorKind::Other
    };
    GatewayError::network(kind, e.to_string())
}

#[async_trait]
impl ProviderExecutor for HttpExecutor {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn format(&self) -> ApiFormat {
        self.format
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn execute(&self, request: ExecutorRequest) -> GatewayResult<Bytes> {
        let response = self.send(&request).await?;
        tokio::select! {
            body = response.bytes() => body.map_err(|e| map_transport_error(&e)),
            () = request.cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }

    async fn execute_stream(&self, request: ExecutorRequest) -> GatewayResult<ChunkStream> {
        let response = self.send(&request).await?;
        let cancel = request.cancel.clone();
        let provider = self.id.clone();

        let stream = try_stream! {
            let mut upstream = response.bytes_stream();
            loop {
                let next = tokio::select! {
                    next = upstream.next() => next,
                    () = cancel.cancelled() => {
                        debug!(provider = %provider, "Upstream stream cancelled");
                        None
                    }
                };
                let Some(chunk) = next else { break };
                let chunk = chunk.map_err(|e| map_transport_error(&e))?;
                yield chunk;
            }
        };

        Ok(Box::pin(stream))
    }
}
