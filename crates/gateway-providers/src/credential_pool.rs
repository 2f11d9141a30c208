//! Credential pool.
//!
//! Holds the usable credentials for every provider and hands one out per
//! upstream attempt. Selection is round-robin over the enabled credentials of
//! a provider; the cursor is a single atomic per provider, so concurrent
//! requests spread evenly without locking.
//!
//! Each selection returns a [`CredentialLease`]. The lease counts as in-flight
//! use of its credential until dropped, which is how a cancelled request
//! releases its slot.

use arc_swap::ArcSwap;
use gateway_core::{Credential, GatewayError, GatewayResult, TokenStore};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
struct Slot {
    credential: Credential,
    in_flight: AtomicUsize,
}

#[derive(Debug, Default)]
struct ProviderSlots {
    slots: Vec<Arc<Slot>>,
    cursor: AtomicUsize,
}

impl ProviderSlots {
    fn from_credentials(credentials: Vec<Credential>) -> Self {
        Self {
            slots: credentials
                .into_iter()
                .map(|credential| {
                    Arc::new(Slot {
                        credential,
                        in_flight: AtomicUsize::new(0),
                    })
                })
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Option<Arc<Slot>> {
        let enabled: Vec<&Arc<Slot>> = self
            .slots
            .iter()
            .filter(|s| !s.credential.disabled)
            .collect();
        if enabled.is_empty() {
            return None;
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % enabled.len();
        Some(Arc::clone(enabled[position]))
    }
}

/// A credential checked out for one upstream attempt
#[derive(Debug)]
pub struct CredentialLease {
    slot: Arc<Slot>,
}

impl CredentialLease {
    fn new(slot: Arc<Slot>) -> Self {
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { slot }
    }

    /// The leased credential
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.slot.credential
    }
}

impl Deref for CredentialLease {
    type Target = Credential;

    fn deref(&self) -> &Credential {
        &self.slot.credential
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of one pooled credential
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
    /// Credential id
    pub id: String,
    /// Owning provider
    pub provider: String,
    /// Display label
    pub label: Option<String>,
    /// Whether selection skips it
    pub disabled: bool,
    /// Leases currently outstanding
    pub in_flight: usize,
}

/// Per-provider credential pool
#[derive(Debug, Default)]
pub struct CredentialPool {
    providers: ArcSwap<HashMap<String, Arc<ProviderSlots>>>,
}

impl CredentialPool {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool holding `credentials`
    #[must_use]
    pub fn from_credentials(credentials: Vec<Credential>) -> Self {
        let pool = Self::new();
        pool.replace_all(credentials);
        pool
    }

    /// Replace the whole pool atomically
    pub fn replace_all(&self, credentials: Vec<Credential>) {
        let mut grouped: HashMap<String, Vec<Credential>> = HashMap::new();
        for credential in credentials {
            grouped
                .entry(credential.provider.clone())
                .or_default()
                .push(credential);
        }
        let providers = grouped
            .into_iter()
            .map(|(provider, list)| (provider, Arc::new(ProviderSlots::from_credentials(list))))
            .collect();
        self.providers.store(Arc::new(providers));
    }

    /// Add one credential, replacing an existing one with the same id
    pub fn insert(&self, credential: Credential) {
        self.providers.rcu(|current| {
            let mut next = HashMap::clone(current);
            let mut list: Vec<Credential> = next
                .get(&credential.provider)
                .map(|p| {
                    p.slots
                        .iter()
                        .filter(|s| s.credential.id != credential.id)
                        .map(|s| s.credential.clone())
                        .collect()
                })
                .unwrap_or_default();
            list.push(credential.clone());
            next.insert(
                credential.provider.clone(),
                Arc::new(ProviderSlots::from_credentials(list)),
            );
            next
        });
    }

    /// Reload every credential from a token store.
    ///
    /// Returns the number of credentials now pooled. Outstanding leases keep
    /// their credential alive until dropped.
    ///
    /// # Errors
    /// Propagates the store's listing error and leaves the pool unchanged
    pub async fn refresh(&self, store: &dyn TokenStore) -> GatewayResult<usize> {
        let credentials = store.list_auth_files().await?;
        let count = credentials.len();
        self.replace_all(credentials);
        info!(credentials = count, providers = self.providers().len(), "Credential pool refreshed");
        Ok(count)
    }

    /// Select the next credential for `provider`
    ///
    /// # Errors
    /// Returns `GatewayError::Dispatch` (503) when the provider has no enabled credential
    pub fn acquire(&self, provider: &str) -> GatewayResult<CredentialLease> {
        let slot = self
            .providers
            .load()
            .get(provider)
            .and_then(|p| p.next())
            .ok_or_else(|| {
                GatewayError::dispatch(503, format!("no credential available for provider {provider}"))
            })?;
        debug!(provider, credential = %slot.credential.id, "Credential selected");
        Ok(CredentialLease::new(slot))
    }

    /// Whether `provider` has at least one enabled credential
    #[must_use]
    pub fn has_credentials(&self, provider: &str) -> bool {
        self.providers
            .load()
            .get(provider)
            .is_some_and(|p| p.slots.iter().any(|s| !s.credential.disabled))
    }

    /// Providers with at least one pooled credential, sorted
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of every pooled credential
    #[must_use]
    pub fn stats(&self) -> Vec<CredentialStats> {
        let mut stats: Vec<CredentialStats> = self
            .providers
            .load()
            .values()
            .flat_map(|p| p.slots.iter())
            .map(|s| CredentialStats {
                id: s.credential.id.clone(),
                provider: s.credential.provider.clone(),
                label: s.credential.label.clone(),
                disabled: s.credential.disabled,
                in_flight: s.in_flight.load(Ordering::Acquire),
            })
            .collect();
        stats.sort_by(|a, b| (&a.provider, &a.id).cmp(&(&b.provider, &b.id)));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_store::StaticTokenStore;

    fn pool() -> CredentialPool {
        CredentialPool::from_credentials(vec![
            Credential::new("a1", "anthropic", "k1"),
            Credential::new("a2", "anthropic", "k2"),
            Credential::new("o1", "openai", "k3"),
        ])
    }

    #[test]
    fn test_round_robin() {
        let pool = pool();
        let picks: Vec<String> = (0..4)
            .map(|_| pool.acquire("anthropic").unwrap().id.clone())
            .collect();
        assert_eq!(picks, vec!["a1", "a2", "a1", "a2"]);
    }

    #[test]
    fn test_disabled_credentials_skipped() {
        let mut disabled = Credential::new("a2", "anthropic", "k2");
        disabled.disabled = true;
        let pool = CredentialPool::from_credentials(vec![
            Credential::new("a1", "anthropic", "k1"),
            disabled,
        ]);
        for _ in 0..3 {
            assert_eq!(pool.acquire("anthropic").unwrap().id, "a1");
        }
    }

    #[test]
    fn test_missing_provider() {
        let err = pool().acquire("gemini").unwrap_err();
        assert_eq!(err.status_code(), 503);
        assert!(!pool().has_credentials("gemini"));
    }

    #[test]
    fn test_lease_released_on_drop() {
        let pool = pool();
        let lease = pool.acquire("openai").unwrap();
        let in_flight = |pool: &CredentialPool| {
            pool.stats()
                .into_iter()
                .find(|s| s.id == "o1")
                .map(|s| s.in_flight)
        };
        assert_eq!(in_flight(&pool), Some(1));
        drop(lease);
        assert_eq!(in_flight(&pool), Some(0));
    }

    #[test]
    fn test_insert_replaces_same_id() {
        let pool = pool();
        pool.insert(Credential::new("o1", "openai", "rotated"));
        pool.insert(Credential::new("g1", "gemini", "k4"));
        assert_eq!(pool.providers(), vec!["anthropic", "gemini", "openai"]);
        assert_eq!(pool.stats().iter().filter(|s| s.provider == "openai").count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_from_store() {
        let pool = pool();
        let store = StaticTokenStore::new(vec![Credential::new("g1", "gemini", "k")]);
        assert_eq!(pool.refresh(&store).await.unwrap(), 1);
        assert_eq!(pool.providers(), vec!["gemini"]);
        assert!(pool.acquire("openai").is_err());
    }

    #[test]
    fn test_concurrent_selection_is_even() {
        let pool = Arc::new(pool());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| pool.acquire("anthropic").unwrap().id == "a1")
                        .count()
                })
            })
            .collect();
        let a1: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(a1, 100);
    }
}
