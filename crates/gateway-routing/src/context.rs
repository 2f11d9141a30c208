//! Per-request fallback context.
//!
//! A context is never mutated; advancing produces a new value. The entry
//! list is shared between successive contexts of one request.
//!
//! A request that starts from a cached entry and fails there restarts at the
//! highest-priority entry, skipping the one that already failed.

use crate::patch::patch_model;
use crate::virtual_model::FallbackEntry;
use bytes::Bytes;
use gateway_core::GatewayResult;
use std::sync::Arc;

/// Fallback progress of one in-flight request
#[derive(Debug, Clone)]
pub struct FallbackContext {
    virtual_model: Option<String>,
    entries: Arc<[FallbackEntry]>,
    current_index: usize,
    original_payload: Bytes,
    was_loaded_from_cache: bool,
    skip: Option<usize>,
}

impl FallbackContext {
    /// Context for a request that does not use a virtual model
    #[must_use]
    pub fn empty(payload: Bytes) -> Self {
        Self {
            virtual_model: None,
            entries: Arc::from(Vec::new()),
            current_index: 0,
            original_payload: payload,
            was_loaded_from_cache: false,
            skip: None,
        }
    }

    /// Context over `entries` (already priority-sorted) starting at `start`
    #[must_use]
    pub fn new(
        virtual_model: impl Into<String>,
        entries: Vec<FallbackEntry>,
        start: usize,
        payload: Bytes,
        from_cache: bool,
    ) -> Self {
        Self {
            virtual_model: Some(virtual_model.into()),
            entries: Arc::from(entries),
            current_index: start,
            original_payload: payload,
            was_loaded_from_cache: from_cache,
            skip: None,
        }
    }

    /// Whether this request is routed through fallback entries
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.virtual_model.is_some() && !self.entries.is_empty()
    }

    /// Virtual model name, if any
    #[must_use]
    pub fn virtual_model(&self) -> Option<&str> {
        self.virtual_model.as_deref()
    }

    /// Entries in priority order
    #[must_use]
    pub fn entries(&self) -> &[FallbackEntry] {
        &self.entries
    }

    /// Index of the entry being attempted
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Entry being attempted
    #[must_use]
    pub fn current_entry(&self) -> Option<&FallbackEntry> {
        self.entries.get(self.current_index)
    }

    /// Whether the starting entry came from the entry cache
    #[must_use]
    pub fn was_loaded_from_cache(&self) -> bool {
        self.was_loaded_from_cache
    }

    /// Caller payload exactly as received
    #[must_use]
    pub fn original_payload(&self) -> &Bytes {
        &self.original_payload
    }

    /// Entry index tried before the walk restarted, never attempted again
    fn next_skip(&self) -> Option<usize> {
        if self.was_loaded_from_cache {
            Some(self.current_index)
        } else {
            self.skip
        }
    }

    fn next_index(&self) -> Option<usize> {
        let from = if self.was_loaded_from_cache {
            0
        } else {
            self.current_index + 1
        };
        let skip = self.next_skip();
        (from..self.entries.len()).find(|i| Some(*i) != skip)
    }

    /// Whether an untried entry remains
    #[must_use]
    pub fn has_more_fallbacks(&self) -> bool {
        self.next_index().is_some()
    }

    /// Context for the next untried entry, `None` once exhausted
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        self.next_index().map(|index| Self {
            virtual_model: self.virtual_model.clone(),
            entries: Arc::clone(&self.entries),
            current_index: index,
            original_payload: self.original_payload.clone(),
            was_loaded_from_cache: false,
            skip: self.next_skip(),
        })
    }

    /// Original payload with its `model` field set to the current entry's model
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` when the payload is not a JSON object
    pub fn payload_for_current(&self) -> GatewayResult<Bytes> {
        match self.current_entry() {
            Some(entry) => patch_model(&self.original_payload, &entry.model_id),
            None => Ok(self.original_payload.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<FallbackEntry> {
        vec![
            FallbackEntry::new("a", "m1", 1),
            FallbackEntry::new("b", "m2", 2),
        ]
    }

    #[test]
    fn test_empty_context() {
        let ctx = FallbackContext::empty(Bytes::from_static(b"{}"));
        assert!(!ctx.is_active());
        assert!(ctx.current_entry().is_none());
        assert!(ctx.next().is_none());
    }

    #[test]
    fn test_advance_produces_new_context() {
        let payload = Bytes::from_static(br#"{"model":"smart","stream":false}"#);
        let ctx = FallbackContext::new("smart", entries(), 0, payload, true);
        assert_eq!(&ctx.payload_for_current().unwrap()[..], br#"{"model":"m1","stream":false}"#);

        let next = ctx.next().unwrap();
        assert_eq!(ctx.current_index(), 0);
        assert_eq!(next.current_index(), 1);
        assert!(!next.was_loaded_from_cache());
        assert!(!next.has_more_fallbacks());
        assert_eq!(&next.payload_for_current().unwrap()[..], br#"{"model":"m2","stream":false}"#);
        assert!(next.next().is_none());
    }

    #[test]
    fn test_failed_cached_start_restarts_from_top() {
        let entries = vec![
            FallbackEntry::new("a", "m1", 1),
            FallbackEntry::new("b", "m2", 2),
            FallbackEntry::new("c", "m3", 3),
        ];
        let ctx = FallbackContext::new("smart", entries, 1, Bytes::from_static(b"{}"), true);
        assert!(ctx.has_more_fallbacks());

        let first = ctx.next().unwrap();
        assert_eq!(first.current_entry().unwrap().provider, "a");
        let second = first.next().unwrap();
        assert_eq!(second.current_entry().unwrap().provider, "c");
        assert!(second.next().is_none());
    }

    #[test]
    fn test_cached_last_entry_still_reaches_earlier_entries() {
        let ctx = FallbackContext::new("smart", entries(), 1, Bytes::from_static(b"{}"), true);
        let next = ctx.next().unwrap();
        assert_eq!(next.current_index(), 0);
        assert!(!next.has_more_fallbacks());
    }
}
