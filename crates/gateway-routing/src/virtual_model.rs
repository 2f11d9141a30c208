//! Virtual models and their fallback entries.
//!
//! Entry priorities are always contiguous `1..=N`: every insert, removal and
//! reorder renumbers the list.

use gateway_core::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One (provider, concrete model) route tried for a virtual model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackEntry {
    /// Entry id
    pub id: String,
    /// Provider id the entry routes to
    pub provider: String,
    /// Concrete upstream model
    pub model_id: String,
    /// Ascending, tried first
    pub priority: u32,
}

impl FallbackEntry {
    /// Create an entry with a fresh id
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider: provider.into(),
            model_id: model_id.into(),
            priority,
        }
    }
}

/// A caller-facing model name mapped onto ordered fallback entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualModel {
    /// Virtual model id
    pub id: String,
    /// Caller-facing name, unique case-insensitively
    pub name: String,
    /// Disabled models are ignored by the engine
    #[serde(default = "enabled")]
    pub is_enabled: bool,
    /// Fallback entries
    #[serde(default)]
    pub fallback_entries: Vec<FallbackEntry>,
}

fn enabled() -> bool {
    true
}

impl VirtualModel {
    /// Create an enabled virtual model with no entries
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            is_enabled: true,
            fallback_entries: Vec::new(),
        }
    }

    /// Case-insensitive name match
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Entries in ascending priority order
    #[must_use]
    pub fn sorted_entries(&self) -> Vec<FallbackEntry> {
        let mut entries = self.fallback_entries.clone();
        entries.sort_by_key(|e| e.priority);
        entries
    }

    /// Append an entry at the lowest priority
    pub fn add_entry(&mut self, provider: impl Into<String>, model_id: impl Into<String>) -> &FallbackEntry {
        self.renumber();
        let priority = self.fallback_entries.len() as u32 + 1;
        self.fallback_entries
            .push(FallbackEntry::new(provider, model_id, priority));
        &self.fallback_entries[self.fallback_entries.len() - 1]
    }

    /// Remove an entry by id, returning whether it existed
    pub fn remove_entry(&mut self, entry_id: &str) -> bool {
        let before = self.fallback_entries.len();
        self.fallback_entries.retain(|e| e.id != entry_id);
        self.renumber();
        self.fallback_entries.len() != before
    }

    /// Reorder entries to follow `ordered_ids`
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` unless `ordered_ids` is a
    /// permutation of the current entry ids
    pub fn reorder_entries(&mut self, ordered_ids: &[String]) -> GatewayResult<()> {
        let mut requested: Vec<&str> = ordered_ids.iter().map(String::as_str).collect();
        let mut current: Vec<&str> = self.fallback_entries.iter().map(|e| e.id.as_str()).collect();
        requested.sort_unstable();
        current.sort_unstable();
        if requested != current {
            return Err(GatewayError::validation(
                "reorder must list every entry of the virtual model exactly once",
                Some("entryIds".to_string()),
                "invalid_reorder",
            ));
        }

        for (position, id) in ordered_ids.iter().enumerate() {
            if let Some(entry) = self.fallback_entries.iter_mut().find(|e| &e.id == id) {
                entry.priority = position as u32 + 1;
            }
        }
        self.renumber();
        Ok(())
    }

    /// Sort by priority and rewrite priorities as `1..=N`
    pub fn renumber(&mut self) {
        self.fallback_entries.sort_by_key(|e| e.priority);
        for (position, entry) in self.fallback_entries.iter_mut().enumerate() {
            entry.priority = position as u32 + 1;
        }
    }
}

/// The persisted fallback document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    /// Global fallback switch
    #[serde(default)]
    pub is_enabled: bool,
    /// Configured virtual models
    #[serde(default)]
    pub virtual_models: Vec<VirtualModel>,
}

impl FallbackConfig {
    /// Find a virtual model by name, case-insensitively
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&VirtualModel> {
        self.virtual_models.iter().find(|vm| vm.matches(name))
    }

    /// Find an enabled virtual model, only when fallback is globally enabled
    #[must_use]
    pub fn find_enabled(&self, name: &str) -> Option<&VirtualModel> {
        if !self.is_enabled {
            return None;
        }
        self.find(name).filter(|vm| vm.is_enabled)
    }

    /// Find a virtual model by id
    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<&VirtualModel> {
        self.virtual_models.iter().find(|vm| vm.id == id)
    }

    /// Mutable lookup by id
    pub fn by_id_mut(&mut self, id: &str) -> Option<&mut VirtualModel> {
        self.virtual_models.iter_mut().find(|vm| vm.id == id)
    }

    /// Names of enabled virtual models, empty when fallback is off
    #[must_use]
    pub fn enabled_names(&self) -> Vec<String> {
        if !self.is_enabled {
            return Vec::new();
        }
        self.virtual_models
            .iter()
            .filter(|vm| vm.is_enabled)
            .map(|vm| vm.name.clone())
            .collect()
    }

    /// Normalise priorities of every virtual model
    pub fn renumber_all(&mut self) {
        for vm in &mut self.virtual_models {
            vm.renumber();
        }
    }
}
