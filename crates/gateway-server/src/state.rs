//! Shared application state.

use gateway_dispatch::Dispatcher;
use gateway_providers::{CredentialPool, ExecutorRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default overall budget for a non-streaming request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    /// The proxy dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Overall budget for a non-streaming request, fallback included
    pub request_timeout: Duration,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("dispatcher", &self.dispatcher)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create a builder
    #[must_use]
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::default()
    }

    /// Seconds since the state was built
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Builder for [`AppState`]
#[derive(Debug, Default)]
pub struct AppStateBuilder {
    dispatcher: Option<Arc<Dispatcher>>,
    request_timeout: Option<Duration>,
}

impl AppStateBuilder {
    /// Set the dispatcher
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the non-streaming request budget
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build the state; without a dispatcher no provider is registered
    #[must_use]
    pub fn build(self) -> AppState {
        let dispatcher = self.dispatcher.unwrap_or_else(|| {
            Arc::new(Dispatcher::new(
                Arc::new(ExecutorRegistry::new()),
                Arc::new(CredentialPool::new()),
            ))
        });
        AppState {
            dispatcher,
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            started_at: Instant::now(),
        }
    }
}
