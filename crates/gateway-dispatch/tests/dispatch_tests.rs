//! Dispatcher tests against in-process executors

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use gateway_core::{
    ApiFormat, ChunkStream, Credential, ExecutorRequest, GatewayError, GatewayResult,
    ProviderExecutor,
};
use gateway_dispatch::{DispatchRequest, Dispatcher};
use gateway_providers::{CredentialPool, ExecutorRegistry};
use gateway_resilience::{RetryConfig, RetryPolicy};
use gateway_routing::{
    EntryCache, FallbackConfig, FallbackEngine, FallbackStore, RouteState, VirtualModel,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Behavior {
    Reply,
    Fail(u16, &'static str),
    Stream(Vec<String>),
    Hang,
}

struct MockExecutor {
    id: String,
    models: Vec<String>,
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
    seen_models: Arc<Mutex<Vec<String>>>,
}

impl MockExecutor {
    fn new(id: &str, behavior: Behavior) -> Self {
        Self {
            id: id.to_string(),
            models: Vec::new(),
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            seen_models: Arc::default(),
        }
    }

    fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    fn reply_body(&self, model: &str) -> Bytes {
        Bytes::from(
            serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "model": model,
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": format!("from {}", self.id)},
                    "finish_reason": "stop"
                }]
            })
            .to_string(),
        )
    }
}

#[async_trait]
impl ProviderExecutor for MockExecutor {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn format(&self) -> ApiFormat {
        ApiFormat::OpenAI
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn execute(&self, request: ExecutorRequest) -> GatewayResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_models.lock().unwrap().push(request.model.clone());
        match &self.behavior {
            Behavior::Reply | Behavior::Stream(_) => Ok(self.reply_body(&request.model)),
            Behavior::Fail(status, body) => Err(GatewayError::status(&self.id, *status, *body)),
            Behavior::Hang => {
                request.cancel.cancelled().await;
                Err(GatewayError::Cancelled)
            }
        }
    }

    async fn execute_stream(&self, request: ExecutorRequest) -> GatewayResult<ChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_models.lock().unwrap().push(request.model.clone());
        match &self.behavior {
            Behavior::Stream(chunks) => {
                let chunks = chunks.clone();
                Ok(async_stream::stream! {
                    for chunk in chunks {
                        yield Ok(Bytes::from(chunk));
                    }
                }
                .boxed())
            }
            Behavior::Reply => Ok(futures::stream::iter(vec![Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n",
            ))])
            .boxed()),
            Behavior::Fail(status, body) => Err(GatewayError::status(&self.id, *status, *body)),
            Behavior::Hang => {
                request.cancel.cancelled().await;
                Err(GatewayError::Cancelled)
            }
        }
    }
}

struct Harness {
    dispatcher: Dispatcher,
    calls: Vec<(String, Arc<AtomicUsize>)>,
    engine: Option<Arc<FallbackEngine>>,
}

impl Harness {
    fn calls(&self, provider: &str) -> usize {
        self.calls
            .iter()
            .find(|(id, _)| id == provider)
            .map_or(0, |(_, c)| c.load(Ordering::SeqCst))
    }
}

fn harness(executors: Vec<MockExecutor>, fallback: Option<(FallbackConfig, usize)>) -> Harness {
    let registry = ExecutorRegistry::new();
    let mut credentials = Vec::new();
    let mut calls = Vec::new();
    for executor in executors {
        credentials.push(Credential::new(format!("{}-key", executor.id), &executor.id, "sk-test"));
        calls.push((executor.id.clone(), Arc::clone(&executor.calls)));
        registry.register(Arc::new(executor));
    }

    let retry = RetryPolicy::new(RetryConfig {
        max_attempts: 1,
        ..RetryConfig::default()
    });
    let mut dispatcher = Dispatcher::new(
        Arc::new(registry),
        Arc::new(CredentialPool::from_credentials(credentials)),
    )
    .with_retry(retry);

    let engine = fallback.map(|(config, threshold)| {
        let store = FallbackStore::in_memory(
            config,
            Arc::new(EntryCache::default()),
            Arc::new(RouteState::new()),
        );
        Arc::new(FallbackEngine::new(Arc::new(store), threshold))
    });
    if let Some(engine) = &engine {
        dispatcher = dispatcher.with_fallback(Arc::clone(engine));
    }

    Harness {
        dispatcher,
        calls,
        engine,
    }
}

fn fallback_config(name: &str, entries: &[(&str, &str)]) -> FallbackConfig {
    let mut vm = VirtualModel::new(name);
    for (provider, model) in entries {
        vm.add_entry(*provider, *model);
    }
    FallbackConfig {
        is_enabled: true,
        virtual_models: vec![vm],
    }
}

fn chat(model: &str) -> DispatchRequest {
    let payload = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "hello"}]
    });
    DispatchRequest::new(ApiFormat::OpenAI, model, payload.to_string())
}

/// An OpenAI delta event of exactly `total` bytes, blank line included
fn sized_event(total: usize) -> String {
    let frame = |content: &str| {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n")
    };
    let base = frame("").len();
    frame(&"x".repeat(total - base))
}

const STREAM_ERROR: &str = "data: {\"error\":{\"code\":503,\"message\":\"overloaded\"}}\n\n";

#[tokio::test]
async fn test_dispatch_routes_by_advertised_model() {
    let h = harness(
        vec![
            MockExecutor::new("alpha", Behavior::Reply).with_models(&["model-a"]),
            MockExecutor::new("beta", Behavior::Reply).with_models(&["model-b"]),
        ],
        None,
    );

    let response = h.dispatcher.dispatch(chat("model-b")).await.unwrap();
    assert_eq!(response.provider, "beta");
    assert_eq!(response.format, ApiFormat::OpenAI);
    assert_eq!(h.calls("alpha"), 0);
    assert_eq!(h.calls("beta"), 1);
}

#[tokio::test]
async fn test_explicit_providers_win() {
    let h = harness(
        vec![
            MockExecutor::new("alpha", Behavior::Reply).with_models(&["model-a"]),
            MockExecutor::new("beta", Behavior::Reply),
        ],
        None,
    );

    let request = chat("model-a").with_providers(vec!["missing".into(), "beta".into()]);
    let response = h.dispatcher.dispatch(request).await.unwrap();
    assert_eq!(response.provider, "beta");
}

#[tokio::test]
async fn test_provider_prefix_is_stripped() {
    let beta = MockExecutor::new("beta", Behavior::Reply);
    let seen = Arc::clone(&beta.seen_models);
    let h = harness(vec![MockExecutor::new("alpha", Behavior::Reply), beta], None);

    let response = h.dispatcher.dispatch(chat("beta/some-model")).await.unwrap();
    assert_eq!(response.provider, "beta");
    assert_eq!(response.model, "some-model");
    assert_eq!(*seen.lock().unwrap(), vec!["some-model".to_string()]);
}

#[tokio::test]
async fn test_unknown_model_uses_every_provider() {
    let h = harness(vec![MockExecutor::new("alpha", Behavior::Reply)], None);
    let providers = h.dispatcher.resolve_providers("mystery", &[]).unwrap();
    assert_eq!(providers, vec!["alpha".to_string()]);
}

#[tokio::test]
async fn test_no_providers_is_bad_request() {
    let h = harness(Vec::new(), None);
    let err = h.dispatcher.dispatch(chat("gpt-4o")).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_upstream_error_surfaces_without_fallback() {
    let h = harness(vec![MockExecutor::new("alpha", Behavior::Fail(404, "no such thing"))], None);
    let err = h.dispatcher.dispatch(chat("whatever")).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_missing_credential_moves_to_next_provider() {
    let registry = ExecutorRegistry::new();
    registry.register(Arc::new(MockExecutor::new("alpha", Behavior::Reply)));
    registry.register(Arc::new(MockExecutor::new("beta", Behavior::Reply)));
    let pool = CredentialPool::from_credentials(vec![Credential::new("b1", "beta", "sk")]);
    let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(pool));

    let request = chat("m").with_providers(vec!["alpha".into(), "beta".into()]);
    let response = dispatcher.dispatch(request).await.unwrap();
    assert_eq!(response.provider, "beta");
}

#[tokio::test]
async fn test_fallback_walks_entries_and_caches_winner() {
    let config = fallback_config(
        "smart",
        &[("alpha", "a-1"), ("beta", "b-1"), ("gamma", "c-1")],
    );
    let h = harness(
        vec![
            MockExecutor::new("alpha", Behavior::Fail(429, "rate limit")),
            MockExecutor::new("beta", Behavior::Fail(429, "rate limit")),
            MockExecutor::new("gamma", Behavior::Reply),
        ],
        Some((config, 4096)),
    );

    let response = h.dispatcher.dispatch_with_fallback(chat("smart")).await.unwrap();
    assert_eq!(response.provider, "gamma");
    assert_eq!(response.model, "c-1");
    assert_eq!(response.virtual_model.as_deref(), Some("smart"));
    assert_eq!((h.calls("alpha"), h.calls("beta"), h.calls("gamma")), (1, 1, 1));

    let engine = h.engine.as_ref().unwrap();
    assert!(engine.cache().get("smart").is_some());
    let route = engine.routes().get("smart").unwrap();
    assert_eq!(route.provider, "gamma");
    assert_eq!(route.entry_index, 2);

    // The cached entry is the starting point of the next request
    let response = h.dispatcher.dispatch_with_fallback(chat("smart")).await.unwrap();
    assert_eq!(response.provider, "gamma");
    assert_eq!((h.calls("alpha"), h.calls("beta"), h.calls("gamma")), (1, 1, 2));
}

#[tokio::test]
async fn test_failing_cached_entry_falls_back_to_first_entry() {
    let config = fallback_config(
        "smart",
        &[("alpha", "a-1"), ("beta", "b-1"), ("gamma", "c-1")],
    );
    let gamma_id = config.virtual_models[0].fallback_entries[2].id.clone();
    let h = harness(
        vec![
            MockExecutor::new("alpha", Behavior::Reply),
            MockExecutor::new("beta", Behavior::Reply),
            MockExecutor::new("gamma", Behavior::Fail(429, "quota exceeded")),
        ],
        Some((config, 4096)),
    );
    let engine = h.engine.as_ref().unwrap();
    engine.cache().insert("smart", gamma_id);

    let response = h.dispatcher.dispatch_with_fallback(chat("smart")).await.unwrap();
    assert_eq!(response.provider, "alpha");
    assert_eq!((h.calls("alpha"), h.calls("beta"), h.calls("gamma")), (1, 0, 1));
    assert!(engine.cache().get("smart").is_none());
    assert_eq!(engine.routes().get("smart").unwrap().provider, "alpha");

    // With the cache cleared the next request starts at the first entry
    let response = h.dispatcher.dispatch_with_fallback(chat("smart")).await.unwrap();
    assert_eq!(response.provider, "alpha");
    assert_eq!((h.calls("alpha"), h.calls("beta"), h.calls("gamma")), (2, 0, 1));
}

#[tokio::test]
async fn test_fallback_patches_model_into_payload() {
    let beta = MockExecutor::new("beta", Behavior::Reply);
    let seen = Arc::clone(&beta.seen_models);
    let config = fallback_config("smart", &[("alpha", "a-1"), ("beta", "b-1")]);
    let h = harness(
        vec![MockExecutor::new("alpha", Behavior::Fail(503, "down")), beta],
        Some((config, 4096)),
    );

    h.dispatcher.dispatch_with_fallback(chat("smart")).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["b-1".to_string()]);
}

#[tokio::test]
async fn test_non_trigger_error_stops_fallback() {
    let config = fallback_config("smart", &[("alpha", "a-1"), ("beta", "b-1")]);
    let h = harness(
        vec![
            MockExecutor::new("alpha", Behavior::Fail(404, "no route")),
            MockExecutor::new("beta", Behavior::Reply),
        ],
        Some((config, 4096)),
    );

    let err = h.dispatcher.dispatch_with_fallback(chat("smart")).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert_eq!(h.calls("beta"), 0);
}

#[tokio::test]
async fn test_exhausted_fallback_returns_last_error() {
    let config = fallback_config("smart", &[("alpha", "a-1"), ("beta", "b-1")]);
    let h = harness(
        vec![
            MockExecutor::new("alpha", Behavior::Fail(429, "slow down")),
            MockExecutor::new("beta", Behavior::Fail(503, "overloaded")),
        ],
        Some((config, 4096)),
    );

    let err = h.dispatcher.dispatch_with_fallback(chat("smart")).await.unwrap_err();
    assert_eq!(err.status_code(), 503);
    assert!(h.engine.as_ref().unwrap().cache().get("smart").is_none());
}

#[tokio::test]
async fn test_unregistered_entry_provider_is_skipped() {
    let config = fallback_config("smart", &[("ghost", "g-1"), ("beta", "b-1")]);
    let h = harness(vec![MockExecutor::new("beta", Behavior::Reply)], Some((config, 4096)));

    let response = h.dispatcher.dispatch_with_fallback(chat("smart")).await.unwrap();
    assert_eq!(response.provider, "beta");
}

#[tokio::test]
async fn test_virtual_model_without_entries_is_rejected() {
    let config = fallback_config("empty", &[]);
    let h = harness(vec![MockExecutor::new("alpha", Behavior::Reply)], Some((config, 4096)));

    let err = h.dispatcher.dispatch_with_fallback(chat("empty")).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_concrete_model_bypasses_fallback() {
    let config = fallback_config("smart", &[("alpha", "a-1")]);
    let h = harness(
        vec![MockExecutor::new("alpha", Behavior::Reply).with_models(&["a-1"])],
        Some((config, 4096)),
    );

    let response = h.dispatcher.dispatch_with_fallback(chat("a-1")).await.unwrap();
    assert_eq!(response.provider, "alpha");
    assert!(response.virtual_model.is_none());
}

#[tokio::test]
async fn test_stream_passthrough() {
    let h = harness(vec![MockExecutor::new("alpha", Behavior::Reply)], None);
    let stream = h
        .dispatcher
        .dispatch_stream(chat("m").with_stream(true))
        .await
        .unwrap();
    assert_eq!(stream.provider(), "alpha");

    let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
    let body: Vec<u8> = chunks.concat();
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("\"content\":\"hi\""));
    assert!(text.contains("[DONE]"));
}

#[tokio::test]
async fn test_stream_error_before_threshold_falls_back() {
    let threshold = 64;
    let config = fallback_config("smart", &[("alpha", "a-1"), ("beta", "b-1")]);
    let h = harness(
        vec![
            MockExecutor::new(
                "alpha",
                Behavior::Stream(vec![sized_event(threshold), STREAM_ERROR.to_string()]),
            ),
            MockExecutor::new("beta", Behavior::Reply),
        ],
        Some((config, threshold + 1)),
    );

    let stream = h
        .dispatcher
        .dispatch_stream_with_fallback(chat("smart").with_stream(true))
        .await
        .unwrap();
    assert_eq!(stream.provider(), "beta");
    assert_eq!(stream.virtual_model(), Some("smart"));

    let items: Vec<GatewayResult<Bytes>> = stream.collect().await;
    assert!(items.iter().all(Result::is_ok));
}

#[tokio::test]
async fn test_stream_error_at_threshold_is_committed() {
    let threshold = 64;
    let config = fallback_config("smart", &[("alpha", "a-1"), ("beta", "b-1")]);
    let h = harness(
        vec![
            MockExecutor::new(
                "alpha",
                Behavior::Stream(vec![sized_event(threshold), STREAM_ERROR.to_string()]),
            ),
            MockExecutor::new("beta", Behavior::Reply),
        ],
        Some((config, threshold)),
    );

    let stream = h
        .dispatcher
        .dispatch_stream_with_fallback(chat("smart").with_stream(true))
        .await
        .unwrap();
    assert_eq!(stream.provider(), "alpha");

    let items: Vec<GatewayResult<Bytes>> = stream.collect().await;
    let forwarded: usize = items
        .iter()
        .filter_map(|item| item.as_ref().ok())
        .map(Bytes::len)
        .sum();
    assert_eq!(forwarded, threshold);
    let err = items.last().unwrap().as_ref().unwrap_err();
    assert_eq!(err.status_code(), 503);
    assert_eq!(h.calls("beta"), 0);
}

#[tokio::test]
async fn test_stream_open_failure_falls_back() {
    let config = fallback_config("smart", &[("alpha", "a-1"), ("beta", "b-1")]);
    let h = harness(
        vec![
            MockExecutor::new("alpha", Behavior::Fail(401, "invalid api key")),
            MockExecutor::new("beta", Behavior::Reply),
        ],
        Some((config, 4096)),
    );

    let stream = h
        .dispatcher
        .dispatch_stream_with_fallback(chat("smart").with_stream(true))
        .await
        .unwrap();
    assert_eq!(stream.provider(), "beta");
}

#[tokio::test]
async fn test_cancellation_aborts_dispatch() {
    let h = harness(vec![MockExecutor::new("alpha", Behavior::Hang)], None);
    let cancel = CancellationToken::new();
    let request = chat("m").with_cancel(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = h.dispatcher.dispatch(request).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_cancellation_is_not_a_fallback_trigger() {
    let config = fallback_config("smart", &[("alpha", "a-1"), ("beta", "b-1")]);
    let h = harness(
        vec![
            MockExecutor::new("alpha", Behavior::Hang),
            MockExecutor::new("beta", Behavior::Reply),
        ],
        Some((config, 4096)),
    );
    let cancel = CancellationToken::new();
    let request = chat("smart").with_cancel(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = h.dispatcher.dispatch_with_fallback(request).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(h.calls("beta"), 0);
}

#[tokio::test]
async fn test_available_models_and_providers() {
    let config = fallback_config("smart", &[("alpha", "a-1")]);
    let h = harness(
        vec![
            MockExecutor::new("alpha", Behavior::Reply).with_models(&["a-1", "a-2"]),
            MockExecutor::new("beta", Behavior::Reply).with_models(&["b-1"]),
        ],
        Some((config, 4096)),
    );

    assert_eq!(
        h.dispatcher.get_available_providers(),
        vec!["alpha".to_string(), "beta".to_string()]
    );

    let models = h.dispatcher.get_available_models();
    let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["a-1", "a-2", "b-1", "smart"]);
    let smart = models.iter().find(|m| m.id == "smart").unwrap();
    assert!(smart.is_virtual);
    assert!(smart.provider.is_none());
}
