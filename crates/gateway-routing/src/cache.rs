//! Last-successful-entry cache.
//!
//! Maps a virtual model name (case-insensitive) to the id of the entry that
//! last succeeded after a fallback hop. Entries expire after a TTL. Losing an
//! entry only costs one extra hop, so writes are last-write-wins.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time an entry stays valid
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// A cached entry id and when it was stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntryInfo {
    /// Fallback entry id
    pub entry_id: String,
    /// Insertion time
    pub cached_at: Instant,
}

impl CachedEntryInfo {
    fn is_valid(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) < ttl
    }
}

/// TTL map of virtual model name to entry id
#[derive(Debug)]
pub struct EntryCache {
    ttl: Duration,
    entries: DashMap<String, CachedEntryInfo>,
}

impl Default for EntryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl EntryCache {
    /// Create a cache with the given TTL
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    /// Configured TTL
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Valid cached entry id for `virtual_model`; expired entries are evicted
    #[must_use]
    pub fn get(&self, virtual_model: &str) -> Option<String> {
        self.get_at(virtual_model, Instant::now())
    }

    fn get_at(&self, virtual_model: &str, now: Instant) -> Option<String> {
        let key = Self::key(virtual_model);
        let info = self.entries.get(&key).map(|e| e.value().clone())?;
        if info.is_valid(self.ttl, now) {
            return Some(info.entry_id);
        }
        self.entries
            .remove_if(&key, |_, current| current.cached_at == info.cached_at);
        debug!(virtual_model, "Cached fallback entry expired");
        None
    }

    /// Remember `entry_id` as the starting entry for `virtual_model`
    pub fn insert(&self, virtual_model: &str, entry_id: impl Into<String>) {
        self.entries.insert(
            Self::key(virtual_model),
            CachedEntryInfo {
                entry_id: entry_id.into(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Forget the entry for `virtual_model`
    pub fn invalidate(&self, virtual_model: &str) {
        self.entries.remove(&Self::key(virtual_model));
    }

    /// Forget everything
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, expired ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get_case_insensitive() {
        let cache = EntryCache::default();
        cache.insert("Smart", "e3");
        assert_eq!(cache.get("smart").as_deref(), Some("e3"));
        cache.insert("SMART", "e2");
        assert_eq!(cache.get("smart").as_deref(), Some("e2"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_evicted() {
        let cache = EntryCache::new(Duration::from_secs(300));
        cache.insert("smart", "e3");
        let later = Instant::now() + Duration::from_secs(301);
        assert_eq!(cache.get_at("smart", later), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = EntryCache::default();
        cache.insert("smart", "e1");
        cache.insert("fast", "e9");
        cache.invalidate("SMART");
        assert!(cache.get("smart").is_none());
        assert!(cache.get("fast").is_some());
        cache.clear();
        assert!(cache.is_empty());
    }
}
