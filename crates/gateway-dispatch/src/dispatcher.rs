//! The proxy dispatcher.
//!
//! Provider resolution order: the request's explicit provider list (filtered
//! to registered executors), then providers inferred from the model name,
//! then every registered provider. Each upstream attempt is composed as
//! circuit breaker, then deadline, then retry, then per-attempt timeout; a
//! fresh credential is leased for every retry.
//!
//! Fallback entries of a virtual model are tried strictly one after another
//! in priority order.

use crate::request::{AvailableModel, DispatchRequest, DispatchResponse};
use crate::stream::{DispatchStream, StreamMessage};
use bytes::Bytes;
use futures::StreamExt;
use gateway_core::{ChunkStream, ExecutorRequest, GatewayError, GatewayResult, ProviderExecutor};
use gateway_providers::{CredentialLease, CredentialPool, ExecutorRegistry};
use gateway_resilience::{
    counts_as_failure, with_timeout_signal, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, Deadline, RetryPolicy, TimeoutConfig,
};
use gateway_routing::{
    infer_providers, patch_model, split_provider_prefix, FallbackContext, FallbackEngine,
};
use gateway_telemetry::{attempt_span, dispatch_span};
use gateway_translator::{StreamTranscoder, TranslatorRegistry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Default capacity of the stream pump channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Providers and payload chosen for one dispatch
#[derive(Debug)]
struct Route {
    providers: Vec<String>,
    model: String,
    payload: Bytes,
}

/// Whether an error means the route could not be used at all, so the next
/// resolved provider may be tried
fn is_route_unavailable(error: &GatewayError) -> bool {
    match error {
        GatewayError::CircuitOpen { .. } => true,
        GatewayError::Dispatch { status_code, .. } => *status_code == 503,
        _ => false,
    }
}

fn not_registered(provider: &str) -> GatewayError {
    GatewayError::dispatch(503, format!("provider {provider} is not registered"))
}

/// Top-level request orchestrator
pub struct Dispatcher {
    executors: Arc<ExecutorRegistry>,
    credentials: Arc<CredentialPool>,
    translators: Arc<TranslatorRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
    fallback: Option<Arc<FallbackEngine>>,
    channel_capacity: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("providers", &self.executors.providers())
            .field("retry", &self.retry)
            .field("timeouts", &self.timeouts)
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher with default translators and resilience settings
    #[must_use]
    pub fn new(executors: Arc<ExecutorRegistry>, credentials: Arc<CredentialPool>) -> Self {
        Self {
            executors,
            credentials,
            translators: Arc::new(TranslatorRegistry::with_defaults()),
            breakers: Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            retry: RetryPolicy::with_defaults(),
            timeouts: TimeoutConfig::default(),
            fallback: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Use a custom translator registry
    #[must_use]
    pub fn with_translators(mut self, translators: Arc<TranslatorRegistry>) -> Self {
        self.translators = translators;
        self
    }

    /// Use a custom breaker registry
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the timeouts
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Enable virtual-model fallback
    #[must_use]
    pub fn with_fallback(mut self, engine: Arc<FallbackEngine>) -> Self {
        self.fallback = Some(engine);
        self
    }

    /// Set the stream pump channel capacity
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Executor registry
    #[must_use]
    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    /// Credential pool
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.credentials
    }

    /// Circuit breakers
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Fallback engine, when enabled
    #[must_use]
    pub fn fallback(&self) -> Option<&Arc<FallbackEngine>> {
        self.fallback.as_ref()
    }

    /// Registered provider ids
    #[must_use]
    pub fn get_available_providers(&self) -> Vec<String> {
        self.executors.providers()
    }

    /// Every concrete model advertised by an executor, then the enabled virtual models
    #[must_use]
    pub fn get_available_models(&self) -> Vec<AvailableModel> {
        let mut models: Vec<AvailableModel> = self
            .executors
            .models()
            .into_iter()
            .flat_map(|(provider, ids)| {
                ids.into_iter().map(move |id| AvailableModel {
                    id,
                    provider: Some(provider.clone()),
                    is_virtual: false,
                })
            })
            .collect();
        if let Some(engine) = &self.fallback {
            models.extend(engine.virtual_model_names().into_iter().map(|id| AvailableModel {
                id,
                provider: None,
                is_virtual: true,
            }));
        }
        models
    }

    /// Resolve the providers that may serve `model`
    ///
    /// # Errors
    /// Returns `GatewayError::Dispatch` (400) when no provider is registered
    pub fn resolve_providers(&self, model: &str, explicit: &[String]) -> GatewayResult<Vec<String>> {
        let registered: Vec<String> = explicit
            .iter()
            .filter(|p| self.executors.contains(p))
            .cloned()
            .collect();
        if !registered.is_empty() {
            return Ok(registered);
        }
        if !explicit.is_empty() {
            debug!(requested = ?explicit, "No requested provider is registered");
        }

        let mut inferred: Vec<String> = self
            .executors
            .models()
            .into_iter()
            .filter(|(_, ids)| ids.iter().any(|id| id.eq_ignore_ascii_case(model)))
            .map(|(provider, _)| provider)
            .collect();
        for provider in infer_providers(model) {
            if self.executors.contains(&provider) && !inferred.contains(&provider) {
                inferred.push(provider);
            }
        }
        if !inferred.is_empty() {
            return Ok(inferred);
        }

        let all = self.executors.providers();
        if all.is_empty() {
            return Err(GatewayError::dispatch(400, "no provider available"));
        }
        Ok(all)
    }

    fn plan(&self, request: &DispatchRequest) -> GatewayResult<Route> {
        if request.providers.is_empty() {
            if let Some((provider, model)) = split_provider_prefix(&request.model) {
                if self.executors.contains(provider) {
                    return Ok(Route {
                        providers: vec![provider.to_string()],
                        model: model.to_string(),
                        payload: patch_model(&request.payload, model)?,
                    });
                }
            }
        }
        Ok(Route {
            providers: self.resolve_providers(&request.model, &request.providers)?,
            model: request.model.clone(),
            payload: request.payload.clone(),
        })
    }

    fn executor(&self, provider: &str) -> GatewayResult<Arc<dyn ProviderExecutor>> {
        self.executors
            .get(provider)
            .ok_or_else(|| not_registered(provider))
    }

    fn breaker(&self, provider: &str, model: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .get_or_create(&CircuitBreakerRegistry::key(provider, Some(model)))
    }

    /// Non-streaming call against one provider, returning caller-format bytes
    async fn call_provider(
        &self,
        provider: &str,
        model: &str,
        payload: &Bytes,
        request: &DispatchRequest,
    ) -> GatewayResult<Bytes> {
        let executor = self.executor(provider)?;
        let upstream_format = executor.format();
        let body = self
            .translators
            .translate_request(payload, request.format, upstream_format)?;
        let breaker = self.breaker(provider, model);
        let deadline = Deadline::after(self.timeouts.request);
        let cancel = &request.cancel;

        let raw = breaker
            .execute(|| {
                deadline.run(
                    "upstream request",
                    self.retry.execute_with_cancel(
                        |attempt| {
                            let executor = Arc::clone(&executor);
                            let lease = self.credentials.acquire(provider);
                            let body = body.clone();
                            let request_id = request.request_id.clone();
                            async move {
                                let lease = lease?;
                                debug!(attempt, credential = %lease.id, "Calling upstream");
                                with_timeout_signal(deadline.remaining(), "upstream request", cancel, |child| {
                                    executor.execute(ExecutorRequest {
                                        model: model.to_string(),
                                        payload: body,
                                        credential: lease.credential().clone(),
                                        stream: false,
                                        cancel: child,
                                        request_id,
                                    })
                                })
                                .await
                            }
                        },
                        cancel,
                    ),
                )
            })
            .await?;

        self.translators
            .translate_response(&raw, upstream_format, request.format)
    }

    /// Forward a request to its resolved providers
    ///
    /// # Errors
    /// Returns the upstream error of the last provider tried, or a routing error
    pub async fn dispatch(&self, request: DispatchRequest) -> GatewayResult<DispatchResponse> {
        let span = dispatch_span!(request.request_id, request.model, request.format);
        async {
            let route = self.plan(&request)?;
            let count = route.providers.len();
            let mut last_error = None;

            for (position, provider) in route.providers.iter().enumerate() {
                let result = self
                    .call_provider(provider, &route.model, &route.payload, &request)
                    .instrument(attempt_span!(provider, route.model))
                    .await;
                match result {
                    Ok(body) => {
                        info!(provider = %provider, model = %route.model, "Dispatch succeeded");
                        return Ok(DispatchResponse {
                            body,
                            format: request.format,
                            provider: provider.clone(),
                            model: route.model.clone(),
                            virtual_model: None,
                        });
                    }
                    Err(e) if is_route_unavailable(&e) && position + 1 < count => {
                        warn!(provider = %provider, error = %e, "Provider unavailable, trying next");
                        last_error = Some(e);
                    }
                    Err(e) => {
                        debug!(provider = %provider, error = %e, "Dispatch failed");
                        return Err(e);
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| GatewayError::dispatch(400, "no provider available")))
        }
        .instrument(span)
        .await
    }

    /// Open an upstream stream against one provider and start its pump
    async fn open_stream(
        &self,
        provider: &str,
        model: &str,
        payload: &Bytes,
        request: &DispatchRequest,
    ) -> GatewayResult<DispatchStream> {
        let executor = self.executor(provider)?;
        let upstream_format = executor.format();
        let body = self
            .translators
            .translate_request(payload, request.format, upstream_format)?;
        let transcoder = self
            .translators
            .transcoder(upstream_format, request.format, provider, model)?;
        let breaker = self.breaker(provider, model);
        let stream_cancel = request.cancel.child_token();
        let first_byte = self.timeouts.stream_first_byte;

        let (upstream, lease) = breaker
            .execute(|| {
                self.retry.execute_with_cancel(
                    |attempt| {
                        let executor = Arc::clone(&executor);
                        let lease = self.credentials.acquire(provider);
                        let body = body.clone();
                        let request_id = request.request_id.clone();
                        let stream_cancel = &stream_cancel;
                        async move {
                            let lease = lease?;
                            debug!(attempt, credential = %lease.id, "Opening upstream stream");
                            let upstream = with_timeout_signal(
                                first_byte,
                                "upstream stream start",
                                stream_cancel,
                                |child| {
                                    executor.execute_stream(ExecutorRequest {
                                        model: model.to_string(),
                                        payload: body,
                                        credential: lease.credential().clone(),
                                        stream: true,
                                        cancel: child,
                                        request_id,
                                    })
                                },
                            )
                            .await?;
                            Ok((upstream, lease))
                        }
                    },
                    &stream_cancel,
                )
            })
            .await?;

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(
            pump(upstream, transcoder, tx, stream_cancel.clone(), lease, breaker)
                .instrument(attempt_span!(provider, model)),
        );
        Ok(DispatchStream::new(
            request.format,
            provider,
            model,
            rx,
            stream_cancel.drop_guard(),
        ))
    }

    /// Stream a request from its resolved providers
    ///
    /// # Errors
    /// Returns the error that prevented the stream from opening
    pub async fn dispatch_stream(&self, request: DispatchRequest) -> GatewayResult<DispatchStream> {
        let span = dispatch_span!(request.request_id, request.model, request.format);
        async {
            let route = self.plan(&request)?;
            let count = route.providers.len();
            let mut last_error = None;

            for (position, provider) in route.providers.iter().enumerate() {
                let result = self
                    .open_stream(provider, &route.model, &route.payload, &request)
                    .instrument(attempt_span!(provider, route.model))
                    .await;
                match result {
                    Ok(stream) => {
                        info!(provider = %provider, model = %route.model, "Stream opened");
                        return Ok(stream);
                    }
                    Err(e) if is_route_unavailable(&e) && position + 1 < count => {
                        warn!(provider = %provider, error = %e, "Provider unavailable, trying next");
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(last_error.unwrap_or_else(|| GatewayError::dispatch(400, "no provider available")))
        }
        .instrument(span)
        .await
    }

    /// Request for the current entry of a fallback context
    fn entry_request(&self, request: &DispatchRequest, ctx: &FallbackContext) -> GatewayResult<DispatchRequest> {
        let entry = ctx
            .current_entry()
            .ok_or_else(|| GatewayError::internal("fallback context has no current entry"))?;
        if !self.executors.contains(&entry.provider) {
            return Err(not_registered(&entry.provider));
        }
        Ok(DispatchRequest {
            model: entry.model_id.clone(),
            payload: ctx.payload_for_current()?,
            providers: vec![entry.provider.clone()],
            ..request.clone()
        })
    }

    /// Fallback context for a request, `None` when it does not name a virtual model
    fn fallback_context(&self, request: &DispatchRequest) -> GatewayResult<Option<(&FallbackEngine, FallbackContext)>> {
        let Some(engine) = self.fallback.as_deref() else {
            return Ok(None);
        };
        let ctx = engine.create_context(&request.model, request.payload.clone());
        match ctx.virtual_model() {
            None => Ok(None),
            Some(name) if !ctx.is_active() => Err(GatewayError::dispatch(
                400,
                format!("virtual model {name} has no fallback entries"),
            )),
            Some(_) => Ok(Some((engine, ctx))),
        }
    }

    /// Dispatch, walking the fallback entries when the model is virtual
    ///
    /// # Errors
    /// Returns the last entry's error once every entry failed, or the first
    /// error that does not trigger fallback
    pub async fn dispatch_with_fallback(&self, request: DispatchRequest) -> GatewayResult<DispatchResponse> {
        let Some((engine, mut ctx)) = self.fallback_context(&request)? else {
            return self.dispatch(request).await;
        };

        loop {
            let result = match self.entry_request(&request, &ctx) {
                Ok(attempt) => self.dispatch(attempt).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(mut response) => {
                    engine.record_success(&ctx);
                    response.virtual_model = ctx.virtual_model().map(str::to_string);
                    return Ok(response);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => match engine.advance(&ctx, &e) {
                    Some(next) => ctx = next,
                    None => {
                        error!(virtual_model = ctx.virtual_model().unwrap_or_default(), error = %e, "Fallback failed");
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Streaming dispatch with fallback.
    ///
    /// Output is held back until the inspection threshold is reached or the
    /// stream ends; an error in that window still advances to the next
    /// entry. Once the threshold is reached the stream is committed and later
    /// errors reach the caller in-stream.
    ///
    /// # Errors
    /// Same as [`Dispatcher::dispatch_with_fallback`]
    pub async fn dispatch_stream_with_fallback(&self, request: DispatchRequest) -> GatewayResult<DispatchStream> {
        let Some((engine, mut ctx)) = self.fallback_context(&request)? else {
            return self.dispatch_stream(request).await;
        };
        let threshold = engine.stream_inspection_bytes();

        loop {
            let result = match self.entry_request(&request, &ctx) {
                Ok(attempt) => match self.dispatch_stream(attempt).await {
                    Ok(stream) => inspect(stream, threshold).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            match result {
                Ok(mut stream) => {
                    engine.record_success(&ctx);
                    stream.set_virtual_model(ctx.virtual_model().map(str::to_string));
                    return Ok(stream);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => match engine.advance(&ctx, &e) {
                    Some(next) => ctx = next,
                    None => {
                        error!(virtual_model = ctx.virtual_model().unwrap_or_default(), error = %e, "Streaming fallback failed");
                        return Err(e);
                    }
                },
            }
        }
    }
}

/// Hold chunks until `threshold` bytes arrived or the stream ended
async fn inspect(mut stream: DispatchStream, threshold: usize) -> GatewayResult<DispatchStream> {
    let mut held = Vec::new();
    let mut seen = 0usize;
    while seen < threshold {
        match stream.next().await {
            Some(Ok(chunk)) => {
                seen += chunk.len();
                held.push(chunk);
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    debug!(bytes = seen, threshold, "Stream inspection finished");
    stream.prepend(held);
    Ok(stream)
}

/// Send rendered chunks, failing once the receiver is gone
async fn forward(chunks: Vec<String>, tx: &mpsc::Sender<StreamMessage>) -> GatewayResult<()> {
    for chunk in chunks.into_iter().filter(|c| !c.is_empty()) {
        tx.send(StreamMessage::Chunk(Bytes::from(chunk)))
            .await
            .map_err(|_| GatewayError::Cancelled)?;
    }
    Ok(())
}

async fn pump_chunks(
    upstream: &mut ChunkStream,
    transcoder: &mut StreamTranscoder,
    tx: &mpsc::Sender<StreamMessage>,
    cancel: &CancellationToken,
) -> GatewayResult<()> {
    loop {
        let next = tokio::select! {
            next = upstream.next() => next,
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        let Some(chunk) = next else { break };
        forward(transcoder.push(&chunk?)?, tx).await?;
    }
    forward(transcoder.finish()?, tx).await
}

/// Drive one upstream stream into the channel
async fn pump(
    mut upstream: ChunkStream,
    mut transcoder: StreamTranscoder,
    tx: mpsc::Sender<StreamMessage>,
    cancel: CancellationToken,
    lease: CredentialLease,
    breaker: Arc<CircuitBreaker>,
) {
    let outcome = pump_chunks(&mut upstream, &mut transcoder, &tx, &cancel).await;
    drop(upstream);
    drop(lease);
    match outcome {
        Ok(()) => {
            let _ = tx.send(StreamMessage::Done).await;
        }
        Err(e) if e.is_cancelled() => debug!("Stream cancelled by caller"),
        Err(e) => {
            if counts_as_failure(&e) {
                breaker.record_failure();
            }
            warn!(error = %e, "Upstream stream failed");
            let _ = tx.send(StreamMessage::Error(e)).await;
        }
    }
}
