//! Executor registry.
//!
//! Maps provider ids onto their [`ProviderExecutor`]. Registration happens at
//! startup; lookups are lock-free reads from request tasks.

use dashmap::DashMap;
use gateway_core::{ApiFormat, ProviderExecutor};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Registry of provider executors keyed by provider id
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<dyn ProviderExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl ExecutorRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own identifier, replacing any previous one
    pub fn register(&self, executor: Arc<dyn ProviderExecutor>) {
        let id = executor.identifier().to_string();
        info!(
            provider = %id,
            format = %executor.format(),
            models = executor.models().len(),
            "Registered provider executor"
        );
        self.executors.insert(id, executor);
    }

    /// Remove an executor
    pub fn unregister(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.remove(provider).map(|(_, e)| e)
    }

    /// Look up an executor
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.get(provider).map(|e| Arc::clone(e.value()))
    }

    /// Whether a provider id is registered
    #[must_use]
    pub fn contains(&self, provider: &str) -> bool {
        self.executors.contains_key(provider)
    }

    /// Wire format spoken by a registered provider
    #[must_use]
    pub fn format_of(&self, provider: &str) -> Option<ApiFormat> {
        self.executors.get(provider).map(|e| e.format())
    }

    /// Registered provider ids, sorted
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Models advertised by each provider, keyed by provider id
    #[must_use]
    pub fn models(&self) -> BTreeMap<String, Vec<String>> {
        self.executors
            .iter()
            .map(|e| (e.key().clone(), e.value().models()))
            .collect()
    }

    /// Number of registered executors
    #[must_use]
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Whether no executor is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
