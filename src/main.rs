//! # LLM Relay Gateway
//!
//! Multi-provider AI API gateway. Callers speak the OpenAI or Anthropic
//! dialect; requests are translated to whatever the chosen upstream speaks,
//! protected by retries and circuit breakers, and routed through ordered
//! fallback chains when a virtual model is requested.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (the three built-in providers, keys from the environment)
//! OPENAI_API_KEY=sk-... llm-relay-gateway
//!
//! # Start with a config file
//! GATEWAY_CONFIG=/etc/relay/gateway.yaml llm-relay-gateway
//!
//! # Override the port
//! GATEWAY_PORT=9000 llm-relay-gateway
//! ```

use anyhow::Context;
use gateway_config::{load_config, GatewayConfig};
use gateway_core::{Credential, TokenStore};
use gateway_dispatch::Dispatcher;
use gateway_providers::{CredentialPool, ExecutorRegistry, FileTokenStore, HttpExecutor};
use gateway_resilience::{CircuitBreakerRegistry, RetryPolicy};
use gateway_routing::FallbackEngine;
use gateway_server::{AppState, Server};
use gateway_telemetry::init_logging;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be up yet
        eprintln!("llm-relay-gateway: {e:#}");
        error!(error = %e, "Application failed");
        std::process::exit(1);
    }
}

/// Main application logic
async fn run() -> anyhow::Result<()> {
    let config = load_config().await.context("loading configuration")?;
    init_logging(&config.logging).context("initialising logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        "Starting LLM Relay Gateway"
    );

    let executors = create_executor_registry(&config)?;
    let credentials = create_credential_pool(&config, &executors).await?;
    info!(
        providers = executors.len(),
        credentials = credentials.stats().len(),
        "Providers initialized"
    );

    let fallback = FallbackEngine::from_settings(&config.fallback)
        .context("loading fallback configuration")?;
    info!(
        virtual_models = fallback.virtual_model_names().len(),
        enabled = fallback.store().config().is_enabled,
        "Fallback engine initialized"
    );

    let resilience = &config.resilience;
    let dispatcher = Dispatcher::new(Arc::new(executors), Arc::new(credentials))
        .with_retry(RetryPolicy::new(resilience.retry.clone()))
        .with_breakers(Arc::new(CircuitBreakerRegistry::new(
            resilience.circuit_breaker.clone(),
        )))
        .with_timeouts(resilience.timeouts.clone())
        .with_fallback(Arc::new(fallback));

    let state = AppState::builder()
        .dispatcher(Arc::new(dispatcher))
        .request_timeout(config.server.request_timeout)
        .build();

    Server::new(config.server.clone(), state).run().await?;
    Ok(())
}

/// One HTTP executor per enabled provider
fn create_executor_registry(config: &GatewayConfig) -> anyhow::Result<ExecutorRegistry> {
    let registry = ExecutorRegistry::new();

    for provider in config.effective_providers() {
        if !provider.enabled {
            info!(provider = %provider.id, "Provider disabled, skipping");
            continue;
        }

        let mut executor = HttpExecutor::new(&provider.id, provider.format)
            .with_context(|| format!("creating executor for {}", provider.id))?
            .with_models(provider.models.clone());
        if let Some(base_url) = &provider.base_url {
            executor = executor.with_base_url(base_url);
        }

        info!(
            provider = %provider.id,
            format = %provider.format,
            base_url = executor.base_url(),
            "Registered provider"
        );
        registry.register(Arc::new(executor));
    }

    Ok(registry)
}

/// Inline keys, auth files, then `<PROVIDER>_API_KEY` for providers still without one
async fn create_credential_pool(
    config: &GatewayConfig,
    executors: &ExecutorRegistry,
) -> anyhow::Result<CredentialPool> {
    let mut credentials: Vec<Credential> = config
        .credentials
        .keys
        .iter()
        .enumerate()
        .map(|(index, key)| {
            let id = key
                .id
                .clone()
                .unwrap_or_else(|| format!("{}-{index}", key.provider));
            let credential = Credential::new(id, &key.provider, key.api_key.expose_secret().as_str());
            match &key.base_url {
                Some(url) => credential.with_base_url(url),
                None => credential,
            }
        })
        .collect();

    if let Some(dir) = &config.credentials.auth_dir {
        let store = FileTokenStore::new(dir);
        let files = store
            .list_auth_files()
            .await
            .with_context(|| format!("reading auth files from {}", dir.display()))?;
        info!(dir = %dir.display(), credentials = files.len(), "Loaded auth files");
        credentials.extend(files);
    }

    for provider in executors.providers() {
        if credentials.iter().any(|c| c.provider == provider) {
            continue;
        }
        let var = format!("{}_API_KEY", provider.to_ascii_uppercase().replace('-', "_"));
        match std::env::var(&var) {
            Ok(key) if !key.trim().is_empty() => {
                info!(provider = %provider, var = %var, "Using API key from environment");
                credentials.push(Credential::new(format!("{provider}-env"), &provider, key));
            }
            _ => warn!(provider = %provider, var = %var, "Provider has no credentials"),
        }
    }

    Ok(CredentialPool::from_credentials(credentials))
}
