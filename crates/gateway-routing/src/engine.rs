//! Fallback engine.
//!
//! Turns a requested model into a [`FallbackContext`], decides whether a
//! failure advances to the next entry, and remembers which entry finally
//! served a virtual model.

use crate::cache::{EntryCache, DEFAULT_CACHE_TTL};
use crate::context::FallbackContext;
use crate::route_state::{ActiveRoute, RouteState};
use crate::store::FallbackStore;
use crate::trigger::should_trigger_for_error;
use bytes::Bytes;
use gateway_core::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bytes a stream may forward before an upstream error stops triggering fallback
pub const DEFAULT_STREAM_INSPECTION_BYTES: usize = 4096;

/// Fallback engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    /// Persisted fallback document; in-memory only when unset
    pub config_path: Option<PathBuf>,
    /// Lifetime of a cached winning entry
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Streaming inspection threshold in bytes
    pub stream_inspection_bytes: usize,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            config_path: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            stream_inspection_bytes: DEFAULT_STREAM_INSPECTION_BYTES,
        }
    }
}

/// The fallback engine
#[derive(Debug)]
pub struct FallbackEngine {
    store: Arc<FallbackStore>,
    stream_inspection_bytes: usize,
}

impl FallbackEngine {
    /// Create an engine over an existing store
    #[must_use]
    pub fn new(store: Arc<FallbackStore>, stream_inspection_bytes: usize) -> Self {
        Self {
            store,
            stream_inspection_bytes,
        }
    }

    /// Build the store, cache and route state described by `settings`
    ///
    /// # Errors
    /// Returns `GatewayError::Configuration` when the persisted document is unreadable
    pub fn from_settings(settings: &FallbackSettings) -> GatewayResult<Self> {
        let cache = Arc::new(EntryCache::new(settings.cache_ttl));
        let routes = Arc::new(RouteState::new());
        let store = match &settings.config_path {
            Some(path) => FallbackStore::open(path.clone(), cache, routes)?,
            None => FallbackStore::in_memory(Default::default(), cache, routes),
        };
        Ok(Self::new(Arc::new(store), settings.stream_inspection_bytes))
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<FallbackStore> {
        &self.store
    }

    /// Entry cache
    #[must_use]
    pub fn cache(&self) -> &EntryCache {
        self.store.cache()
    }

    /// Route state
    #[must_use]
    pub fn routes(&self) -> &RouteState {
        self.store.routes()
    }

    /// Streaming inspection threshold in bytes
    #[must_use]
    pub fn stream_inspection_bytes(&self) -> usize {
        self.stream_inspection_bytes
    }

    /// Whether `model` currently names an enabled virtual model
    #[must_use]
    pub fn is_virtual(&self, model: &str) -> bool {
        self.store.config().find_enabled(model).is_some()
    }

    /// Names of enabled virtual models
    #[must_use]
    pub fn virtual_model_names(&self) -> Vec<String> {
        self.store.config().enabled_names()
    }

    /// Build the context for a request.
    ///
    /// Returns an empty context unless fallback is enabled and `model` names
    /// an enabled virtual model. A valid cached entry becomes the starting point.
    #[must_use]
    pub fn create_context(&self, model: &str, payload: Bytes) -> FallbackContext {
        let config = self.store.config();
        let Some(vm) = config.find_enabled(model) else {
            return FallbackContext::empty(payload);
        };

        let entries = vm.sorted_entries();
        let cached = self
            .cache()
            .get(&vm.name)
            .and_then(|id| entries.iter().position(|e| e.id == id));

        match cached {
            Some(start) => {
                debug!(virtual_model = %vm.name, start, "Starting from cached fallback entry");
                FallbackContext::new(vm.name.clone(), entries, start, payload, true)
            }
            None => FallbackContext::new(vm.name.clone(), entries, 0, payload, false),
        }
    }

    /// Whether `error` should advance a request to its next entry
    #[must_use]
    pub fn should_trigger(&self, error: &GatewayError) -> bool {
        should_trigger_for_error(error)
    }

    /// Next context after a failure, `None` when the error must be surfaced
    #[must_use]
    pub fn advance(&self, ctx: &FallbackContext, error: &GatewayError) -> Option<FallbackContext> {
        if !self.should_trigger(error) {
            debug!(error = %error, "Error does not trigger fallback");
            return None;
        }
        if ctx.was_loaded_from_cache() {
            if let Some(name) = ctx.virtual_model() {
                self.cache().invalidate(name);
                info!(virtual_model = name, "Cached fallback entry failed, restarting from first entry");
            }
        }
        let next = ctx.next();
        match (&next, ctx.current_entry()) {
            (Some(next_ctx), Some(failed)) => {
                if let Some(to) = next_ctx.current_entry() {
                    warn!(
                        virtual_model = ctx.virtual_model().unwrap_or_default(),
                        from_provider = %failed.provider,
                        from_model = %failed.model_id,
                        to_provider = %to.provider,
                        to_model = %to.model_id,
                        status = error.status_code(),
                        "Falling back to next entry"
                    );
                }
            }
            (None, _) => warn!(
                virtual_model = ctx.virtual_model().unwrap_or_default(),
                status = error.status_code(),
                "Fallback entries exhausted"
            ),
            _ => {}
        }
        next
    }

    /// Record that the current entry of `ctx` served the request
    pub fn record_success(&self, ctx: &FallbackContext) {
        let (Some(name), Some(entry)) = (ctx.virtual_model(), ctx.current_entry()) else {
            return;
        };

        if ctx.current_index() > 0 && !ctx.was_loaded_from_cache() {
            self.cache().insert(name, entry.id.clone());
            info!(
                virtual_model = name,
                provider = %entry.provider,
                model = %entry.model_id,
                "Cached fallback entry"
            );
        }

        self.routes().set(ActiveRoute {
            virtual_model: name.to_string(),
            entry_id: entry.id.clone(),
            provider: entry.provider.clone(),
            model_id: entry.model_id.clone(),
            entry_index: ctx.current_index(),
            updated_at: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_model::{FallbackConfig, VirtualModel};

    fn engine(enabled: bool) -> FallbackEngine {
        let mut vm = VirtualModel::new("Smart");
        vm.add_entry("a", "m1");
        vm.add_entry("b", "m2");
        vm.add_entry("c", "m3");
        let store = FallbackStore::in_memory(
            FallbackConfig {
                is_enabled: enabled,
                virtual_models: vec![vm],
            },
            Arc::new(EntryCache::default()),
            Arc::new(RouteState::new()),
        );
        FallbackEngine::new(Arc::new(store), DEFAULT_STREAM_INSPECTION_BYTES)
    }

    fn payload() -> Bytes {
        Bytes::from_static(br#"{"model":"smart"}"#)
    }

    fn quota() -> GatewayError {
        GatewayError::status("x", 429, "quota exceeded")
    }

    #[test]
    fn test_non_virtual_and_disabled() {
        assert!(!engine(true).create_context("gpt-4o", payload()).is_active());
        assert!(!engine(false).create_context("smart", payload()).is_active());
        assert!(engine(true).is_virtual("SMART"));
    }

    #[test]
    fn test_success_after_advancing_is_cached() {
        let engine = engine(true);
        let ctx = engine.create_context("smart", payload());
        assert_eq!(ctx.current_index(), 0);

        let ctx = engine.advance(&ctx, &quota()).unwrap();
        let ctx = engine.advance(&ctx, &quota()).unwrap();
        assert_eq!(ctx.current_entry().unwrap().provider, "c");
        engine.record_success(&ctx);

        let cached_id = ctx.current_entry().unwrap().id.clone();
        assert_eq!(engine.cache().get("smart"), Some(cached_id));
        assert_eq!(engine.routes().get("smart").unwrap().provider, "c");

        let next = engine.create_context("smart", payload());
        assert!(next.was_loaded_from_cache());
        assert_eq!(next.current_entry().unwrap().provider, "c");
        assert_eq!(&next.payload_for_current().unwrap()[..], br#"{"model":"m3"}"#);
    }

    #[test]
    fn test_first_entry_success_is_not_cached() {
        let engine = engine(true);
        let ctx = engine.create_context("smart", payload());
        engine.record_success(&ctx);
        assert!(engine.cache().is_empty());
        assert_eq!(engine.routes().get("smart").unwrap().entry_index, 0);
    }

    #[test]
    fn test_exhaustion_and_non_triggering_errors() {
        let engine = engine(true);
        let ctx = engine.create_context("smart", payload());
        assert!(engine
            .advance(&ctx, &GatewayError::status("a", 404, "unknown route"))
            .is_none());

        let last = engine.advance(&ctx, &quota()).and_then(|c| engine.advance(&c, &quota())).unwrap();
        assert!(engine.advance(&last, &quota()).is_none());
    }

    #[test]
    fn test_failing_cached_entry_is_evicted() {
        let engine = engine(true);
        let ctx = engine.create_context("smart", payload());
        let winner = engine.advance(&ctx, &quota()).and_then(|c| engine.advance(&c, &quota())).unwrap();
        engine.record_success(&winner);

        let cached = engine.create_context("smart", payload());
        assert_eq!(cached.current_entry().unwrap().provider, "c");

        let retry = engine.advance(&cached, &quota()).unwrap();
        assert!(engine.cache().get("smart").is_none());
        assert_eq!(retry.current_entry().unwrap().provider, "a");
        let retry = engine.advance(&retry, &quota()).unwrap();
        assert_eq!(retry.current_entry().unwrap().provider, "b");
        assert!(engine.advance(&retry, &quota()).is_none());

        // A non-triggering error on the cached entry leaves the cache alone
        engine.cache().insert("smart", winner.current_entry().unwrap().id.clone());
        let cached = engine.create_context("smart", payload());
        assert!(engine
            .advance(&cached, &GatewayError::status("c", 404, "unknown route"))
            .is_none());
        assert!(engine.cache().get("smart").is_some());
    }

    #[test]
    fn test_stale_cached_id_ignored() {
        let engine = engine(true);
        engine.cache().insert("smart", "removed-entry");
        let ctx = engine.create_context("smart", payload());
        assert_eq!(ctx.current_index(), 0);
        assert!(!ctx.was_loaded_from_cache());
    }
}
