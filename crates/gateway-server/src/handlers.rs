//! HTTP request handlers for the gateway API.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use gateway_core::{ApiFormat, GatewayError, GatewayResult};
use gateway_dispatch::{DispatchRequest, DispatchStream};
use gateway_providers::CredentialStats;
use gateway_resilience::{with_timeout, CircuitBreakerStats};
use gateway_routing::{ActiveRoute, FallbackConfig, FallbackEngine, FallbackStore};
use gateway_translator::detect_format;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::{
    error::ApiError,
    extractors::{ProviderHint, RequestId},
    state::AppState,
};

/// Name reported by `/health` and `/version`
pub const GATEWAY_NAME: &str = "llm-relay-gateway";

/// Response header naming the provider that answered
pub const PROVIDER_RESPONSE_HEADER: &str = "x-gateway-provider";
/// Response header naming the concrete model that answered
pub const MODEL_RESPONSE_HEADER: &str = "x-gateway-model";
/// Response header naming the virtual model that was requested
pub const VIRTUAL_MODEL_RESPONSE_HEADER: &str = "x-gateway-virtual-model";

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,
    /// Version
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Registered providers
    pub providers: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        providers: state.dispatcher.executors().len(),
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    /// Service name
    pub name: &'static str,
    /// Version
    pub version: &'static str,
    /// Wire formats the gateway translates between
    pub formats: Vec<&'static str>,
}

/// Version endpoint
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: GATEWAY_NAME,
        version: env!("CARGO_PKG_VERSION"),
        formats: ApiFormat::ALL.iter().map(ApiFormat::as_str).collect(),
    })
}

/// One entry of the OpenAI style model list
#[derive(Debug, Serialize)]
pub struct ModelObject {
    /// Model id
    pub id: String,
    /// Always `model`
    pub object: &'static str,
    /// Provider id, or `virtual`
    pub owned_by: String,
}

/// OpenAI style model list
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    /// Always `list`
    pub object: &'static str,
    /// Models
    pub data: Vec<ModelObject>,
}

/// List models endpoint (OpenAI compatible)
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let data = state
        .dispatcher
        .get_available_models()
        .into_iter()
        .map(|m| ModelObject {
            id: m.id,
            object: "model",
            owned_by: m.provider.unwrap_or_else(|| "virtual".to_string()),
        })
        .collect();

    Json(ModelsResponse {
        object: "list",
        data,
    })
}

/// Fields of a chat body the gateway itself needs
#[derive(Debug, PartialEq, Eq)]
struct ChatFields {
    model: String,
    stream: bool,
}

/// Validate a chat body and pull out the routing fields
fn parse_chat(body: &[u8], format: ApiFormat) -> Result<ChatFields, ApiError> {
    let invalid = |field: &str, message: &str| ApiError::invalid_field(field, message).with_format(format);

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| invalid("body", &format!("request body is not valid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| invalid("body", "request body must be a JSON object"))?;
    if detect_format(&value) == ApiFormat::Gemini {
        return Err(invalid(
            "body",
            "Gemini generateContent payloads are not accepted on this endpoint",
        ));
    }

    let model = object
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| invalid("model", "model is required"))?;

    match object.get("messages") {
        Some(Value::Array(messages)) if !messages.is_empty() => {}
        _ => return Err(invalid("messages", "messages must be a non-empty array")),
    }

    if format == ApiFormat::Anthropic
        && object.get("max_tokens").and_then(Value::as_u64).unwrap_or(0) == 0
    {
        return Err(invalid("max_tokens", "max_tokens must be a positive integer"));
    }

    Ok(ChatFields {
        model: model.to_string(),
        stream: object.get("stream").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn set_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

/// Turn a dispatch stream into an SSE response; a failure after the stream
/// started is rendered as a final event in the caller's dialect
fn sse_response(stream: DispatchStream) -> Response {
    let format = stream.format();
    let provider = stream.provider().to_string();
    let model = stream.model().to_string();
    let virtual_model = stream.virtual_model().map(str::to_string);

    let body = stream.map(move |item| {
        Ok::<Bytes, Infallible>(match item {
            Ok(chunk) => chunk,
            Err(e) => ApiError::from_gateway(&e, format).sse_event(),
        })
    });

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    set_header(&mut response, PROVIDER_RESPONSE_HEADER, &provider);
    set_header(&mut response, MODEL_RESPONSE_HEADER, &model);
    if let Some(name) = virtual_model {
        set_header(&mut response, VIRTUAL_MODEL_RESPONSE_HEADER, &name);
    }
    response
}

/// Shared body of the chat endpoints
async fn proxy(
    state: AppState,
    format: ApiFormat,
    request_id: String,
    providers: Vec<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let fields = parse_chat(&body, format)?;
    debug!(
        request_id = %request_id,
        model = %fields.model,
        stream = fields.stream,
        format = %format,
        "Processing chat request"
    );

    // Dropping the handler (client disconnect) cancels upstream work
    let cancel = CancellationToken::new();
    let cancel_on_drop = cancel.clone().drop_guard();

    let request = DispatchRequest::new(format, fields.model, body)
        .with_request_id(request_id)
        .with_stream(fields.stream)
        .with_providers(providers)
        .with_cancel(cancel);

    if fields.stream {
        let stream = state
            .dispatcher
            .dispatch_stream_with_fallback(request)
            .await
            .map_err(|e| ApiError::from_gateway(&e, format))?;
        // The stream carries its own drop guard from here on
        let _ = cancel_on_drop.disarm();
        info!(provider = %stream.provider(), model = %stream.model(), "Streaming response");
        return Ok(sse_response(stream));
    }

    let response = with_timeout(
        state.request_timeout,
        "request",
        state.dispatcher.dispatch_with_fallback(request),
    )
    .await
    .map_err(|e| ApiError::from_gateway(&e, format))?;

    let mut http = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        response.body,
    )
        .into_response();
    set_header(&mut http, PROVIDER_RESPONSE_HEADER, &response.provider);
    set_header(&mut http, MODEL_RESPONSE_HEADER, &response.model);
    if let Some(name) = &response.virtual_model {
        set_header(&mut http, VIRTUAL_MODEL_RESPONSE_HEADER, name);
    }
    Ok(http)
}

/// `POST /v1/chat/completions`
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn chat_completions(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    ProviderHint(providers): ProviderHint,
    body: Bytes,
) -> Result<Response, ApiError> {
    proxy(state, ApiFormat::OpenAI, request_id, providers, body).await
}

/// `POST /v1/messages`
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn messages(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    ProviderHint(providers): ProviderHint,
    body: Bytes,
) -> Result<Response, ApiError> {
    proxy(state, ApiFormat::Anthropic, request_id, providers, body).await
}

/// Circuit breaker view for one route
#[derive(Debug, Serialize)]
pub struct CircuitStatus {
    /// Breaker key
    pub key: String,
    /// Breaker counters
    #[serde(flatten)]
    pub stats: CircuitBreakerStats,
}

/// Provider status response
#[derive(Debug, Serialize)]
pub struct ProviderStatus {
    /// Provider ID
    pub id: String,
    /// Wire format
    pub format: Option<ApiFormat>,
    /// Advertised models
    pub models: Vec<String>,
    /// Pooled credentials
    pub credentials: Vec<CredentialStats>,
    /// Breakers for this provider's routes
    pub circuits: Vec<CircuitStatus>,
}

/// `GET /admin/providers`
pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderStatus>> {
    let dispatcher = &state.dispatcher;
    let executors = dispatcher.executors();
    let mut models = executors.models();
    let credentials = dispatcher.credentials().stats();
    let circuits = dispatcher.breakers().snapshot();

    let providers = dispatcher
        .get_available_providers()
        .into_iter()
        .map(|id| {
            let prefix = format!("{id}:");
            ProviderStatus {
                format: executors.format_of(&id),
                models: models.remove(&id).unwrap_or_default(),
                credentials: credentials
                    .iter()
                    .filter(|c| c.provider == id)
                    .cloned()
                    .collect(),
                circuits: circuits
                    .iter()
                    .filter(|(key, _)| *key == id || key.starts_with(&prefix))
                    .map(|(key, stats)| CircuitStatus {
                        key: key.clone(),
                        stats: stats.clone(),
                    })
                    .collect(),
                id,
            }
        })
        .collect();

    Json(providers)
}

fn fallback_engine(state: &AppState) -> Result<&Arc<FallbackEngine>, ApiError> {
    state
        .dispatcher
        .fallback()
        .ok_or_else(|| ApiError::not_found("fallback is not configured"))
}

/// Store mutations persist to disk, so they run on the blocking pool
async fn with_store<T, F>(state: &AppState, edit: F) -> Result<T, ApiError>
where
    F: FnOnce(&FallbackStore) -> GatewayResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(fallback_engine(state)?.store());
    tokio::task::spawn_blocking(move || edit(&store))
        .await
        .map_err(|e| GatewayError::internal(format!("fallback store task failed: {e}")))?
        .map_err(ApiError::from)
}

/// `GET /admin/fallback`
pub async fn get_fallback(State(state): State<AppState>) -> Result<Json<FallbackConfig>, ApiError> {
    let engine = fallback_engine(&state)?;
    Ok(Json(engine.store().config().as_ref().clone()))
}

/// Active routes response
#[derive(Debug, Serialize)]
pub struct RoutesResponse {
    /// Entry currently serving each virtual model
    pub routes: Vec<ActiveRoute>,
}

/// `GET /admin/fallback/routes`
pub async fn fallback_routes(State(state): State<AppState>) -> Result<Json<RoutesResponse>, ApiError> {
    let engine = fallback_engine(&state)?;
    Ok(Json(RoutesResponse {
        routes: engine.routes().snapshot(),
    }))
}

/// Body of `PUT /admin/fallback/enabled`
#[derive(Debug, Deserialize)]
pub struct EnabledBody {
    /// New switch value
    pub enabled: bool,
}

/// `PUT /admin/fallback/enabled`
pub async fn set_fallback_enabled(
    State(state): State<AppState>,
    Json(body): Json<EnabledBody>,
) -> Result<Json<FallbackConfig>, ApiError> {
    let config = with_store(&state, move |store| {
        store.set_enabled(body.enabled)?;
        Ok(store.config())
    })
    .await?;
    Ok(Json(config.as_ref().clone()))
}

/// Body of `POST /admin/fallback/models`
#[derive(Debug, Deserialize)]
pub struct CreateVirtualModel {
    /// Caller-facing name
    pub name: String,
}

/// `POST /admin/fallback/models`
pub async fn create_virtual_model(
    State(state): State<AppState>,
    Json(body): Json<CreateVirtualModel>,
) -> Result<Response, ApiError> {
    let vm = with_store(&state, move |store| store.add_virtual_model(&body.name)).await?;
    Ok((StatusCode::CREATED, Json(vm)).into_response())
}

/// Body of `PATCH /admin/fallback/models/:id`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateVirtualModel {
    /// New name
    pub name: Option<String>,
    /// New enabled flag
    pub is_enabled: Option<bool>,
}

/// `PATCH /admin/fallback/models/:id`
pub async fn update_virtual_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateVirtualModel>,
) -> Result<Json<FallbackConfig>, ApiError> {
    let config = with_store(&state, move |store| {
        if let Some(name) = &body.name {
            store.rename_virtual_model(&id, name)?;
        }
        if let Some(enabled) = body.is_enabled {
            store.set_virtual_model_enabled(&id, enabled)?;
        }
        Ok(store.config())
    })
    .await?;
    Ok(Json(config.as_ref().clone()))
}

/// `DELETE /admin/fallback/models/:id`
pub async fn delete_virtual_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    with_store(&state, move |store| store.remove_virtual_model(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body of `POST /admin/fallback/models/:id/entries`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntry {
    /// Provider id
    pub provider: String,
    /// Concrete model
    pub model_id: String,
}

/// `POST /admin/fallback/models/:id/entries`
pub async fn create_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateEntry>,
) -> Result<Response, ApiError> {
    let entry = with_store(&state, move |store| {
        store.add_fallback_entry(&id, &body.provider, &body.model_id)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

/// `DELETE /admin/fallback/models/:id/entries/:entry_id`
pub async fn delete_entry(
    State(state): State<AppState>,
    Path((id, entry_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    with_store(&state, move |store| store.remove_fallback_entry(&id, &entry_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body of `PUT /admin/fallback/models/:id/order`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderEntries {
    /// Every entry id of the virtual model, in the new order
    pub entry_ids: Vec<String>,
}

/// `PUT /admin/fallback/models/:id/order`
pub async fn reorder_entries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReorderEntries>,
) -> Result<Json<FallbackConfig>, ApiError> {
    let config = with_store(&state, move |store| {
        store.reorder_fallback_entries(&id, &body.entry_ids)?;
        Ok(store.config())
    })
    .await?;
    Ok(Json(config.as_ref().clone()))
}

/// Fallback for unknown routes
pub async fn not_found() -> ApiError {
    ApiError::not_found("unknown endpoint")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_chat() {
        let body = br#"{"model":"gpt-4o","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
        let fields = parse_chat(body, ApiFormat::OpenAI).unwrap();
        assert_eq!(
            fields,
            ChatFields {
                model: "gpt-4o".into(),
                stream: true
            }
        );
    }

    #[test]
    fn test_missing_model_is_invalid() {
        let body = br#"{"messages":[{"role":"user","content":"hi"}]}"#;
        let err = parse_chat(body, ApiFormat::OpenAI).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.details.unwrap()["field"], "model");
    }

    #[test]
    fn test_empty_messages_is_invalid() {
        let body = br#"{"model":"m","messages":[]}"#;
        assert!(parse_chat(body, ApiFormat::OpenAI).is_err());
    }

    #[test]
    fn test_anthropic_requires_max_tokens() {
        let body = br#"{"model":"claude-3","messages":[{"role":"user","content":"hi"}]}"#;
        let err = parse_chat(body, ApiFormat::Anthropic).unwrap_err();
        assert_eq!(err.format, ApiFormat::Anthropic);

        let body = br#"{"model":"claude-3","max_tokens":64,"messages":[{"role":"user","content":"hi"}]}"#;
        assert!(parse_chat(body, ApiFormat::Anthropic).is_ok());
    }

    #[test]
    fn test_gemini_payload_is_rejected() {
        let body = br#"{"model":"gemini-1.5-pro","contents":[{"role":"user","parts":[{"text":"hi"}]}]}"#;
        for format in [ApiFormat::OpenAI, ApiFormat::Anthropic] {
            let err = parse_chat(body, format).unwrap_err();
            assert_eq!(err.format, format);
            assert_eq!(err.details.unwrap()["field"], "body");
        }
    }

    #[test]
    fn test_openai_text_parts_are_not_mistaken_for_gemini() {
        let body = br#"{"model":"gpt-4o","max_tokens":16,"messages":[{"role":"user","content":[{"type":"text","text":"hi"}]}]}"#;
        assert!(parse_chat(body, ApiFormat::OpenAI).is_ok());
    }

    #[test]
    fn test_invalid_json() {
        let err = parse_chat(b"not json", ApiFormat::OpenAI).unwrap_err();
        assert_eq!(err.error_type, "invalid_request_error");
    }
}
