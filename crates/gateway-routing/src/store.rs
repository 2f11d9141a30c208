//! Persisted fallback configuration.
//!
//! The document is loaded once and served from memory. Every mutation edits a
//! copy, re-saves the whole document (temp file, then rename) and only then
//! publishes it. Renaming, removing or disabling a virtual model drops its
//! cached entry and route state. Mutations block on file I/O.

use crate::cache::EntryCache;
use crate::route_state::RouteState;
use crate::virtual_model::{FallbackConfig, FallbackEntry, VirtualModel};
use arc_swap::ArcSwap;
use gateway_core::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Fallback configuration store
#[derive(Debug)]
pub struct FallbackStore {
    path: Option<PathBuf>,
    config: ArcSwap<FallbackConfig>,
    write_lock: Mutex<()>,
    cache: Arc<EntryCache>,
    routes: Arc<RouteState>,
}

fn not_found(what: &str, id: &str) -> GatewayError {
    GatewayError::dispatch(404, format!("{what} {id} not found"))
}

impl FallbackStore {
    /// Load the document at `path`; a missing file yields an empty, disabled config
    ///
    /// # Errors
    /// Returns `GatewayError::Configuration` when the file exists but cannot be read or parsed
    pub fn open(path: impl Into<PathBuf>, cache: Arc<EntryCache>, routes: Arc<RouteState>) -> GatewayResult<Self> {
        let path = path.into();
        let mut config = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<FallbackConfig>(&raw).map_err(|e| {
                GatewayError::configuration(format!("invalid fallback config {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No fallback config yet, starting empty");
                FallbackConfig::default()
            }
            Err(e) => {
                return Err(GatewayError::configuration(format!(
                    "cannot read fallback config {}: {e}",
                    path.display()
                )))
            }
        };
        config.renumber_all();
        info!(
            path = %path.display(),
            enabled = config.is_enabled,
            virtual_models = config.virtual_models.len(),
            "Loaded fallback config"
        );

        Ok(Self {
            path: Some(path),
            config: ArcSwap::from_pointee(config),
            write_lock: Mutex::new(()),
            cache,
            routes,
        })
    }

    /// Store that never touches disk
    #[must_use]
    pub fn in_memory(mut config: FallbackConfig, cache: Arc<EntryCache>, routes: Arc<RouteState>) -> Self {
        config.renumber_all();
        Self {
            path: None,
            config: ArcSwap::from_pointee(config),
            write_lock: Mutex::new(()),
            cache,
            routes,
        }
    }

    /// Current document
    #[must_use]
    pub fn config(&self) -> Arc<FallbackConfig> {
        self.config.load_full()
    }

    /// Backing file, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Entry cache invalidated by mutations
    #[must_use]
    pub fn cache(&self) -> &Arc<EntryCache> {
        &self.cache
    }

    /// Route state invalidated by mutations
    #[must_use]
    pub fn routes(&self) -> &Arc<RouteState> {
        &self.routes
    }

    fn save(&self, config: &FallbackConfig) -> GatewayResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| GatewayError::internal(format!("cannot encode fallback config: {e}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::internal(format!("cannot create {}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, path))
            .map_err(|e| {
                warn!(path = %path.display(), error = %e, "Failed to save fallback config");
                GatewayError::internal(format!("cannot save fallback config: {e}"))
            })
    }

    /// Apply `edit` to a copy, persist it, then publish it.
    ///
    /// `edit` returns the names whose cache and route state must be dropped.
    fn mutate<T, F>(&self, edit: F) -> GatewayResult<T>
    where
        F: FnOnce(&mut FallbackConfig) -> GatewayResult<(T, Vec<String>)>,
    {
        let _guard = self.write_lock.lock();
        let mut next = FallbackConfig::clone(&self.config.load());
        let (value, invalidated) = edit(&mut next)?;
        next.renumber_all();
        self.save(&next)?;
        self.config.store(Arc::new(next));
        for name in invalidated {
            self.cache.invalidate(&name);
            self.routes.remove(&name);
        }
        Ok(value)
    }

    /// Toggle fallback globally
    ///
    /// # Errors
    /// Fails when the document cannot be saved
    pub fn set_enabled(&self, enabled: bool) -> GatewayResult<()> {
        self.mutate(|config| {
            config.is_enabled = enabled;
            let invalidated = if enabled {
                Vec::new()
            } else {
                config.virtual_models.iter().map(|vm| vm.name.clone()).collect()
            };
            Ok(((), invalidated))
        })?;
        info!(enabled, "Fallback toggled");
        Ok(())
    }

    /// Add a virtual model
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` for an empty or duplicate name
    pub fn add_virtual_model(&self, name: &str) -> GatewayResult<VirtualModel> {
        let name = name.trim();
        let vm = self.mutate(|config| {
            if name.is_empty() {
                return Err(GatewayError::validation("virtual model name must not be empty", Some("name".into()), "invalid_name"));
            }
            if config.find(name).is_some() {
                return Err(GatewayError::validation(
                    format!("virtual model {name} already exists"),
                    Some("name".into()),
                    "duplicate_name",
                ));
            }
            let vm = VirtualModel::new(name);
            config.virtual_models.push(vm.clone());
            Ok((vm, Vec::new()))
        })?;
        info!(virtual_model = %vm.name, id = %vm.id, "Virtual model added");
        Ok(vm)
    }

    /// Remove a virtual model
    ///
    /// # Errors
    /// Returns a 404 `GatewayError::Dispatch` for an unknown id
    pub fn remove_virtual_model(&self, id: &str) -> GatewayResult<()> {
        let name = self.mutate(|config| {
            let vm = config.by_id(id).ok_or_else(|| not_found("virtual model", id))?;
            let name = vm.name.clone();
            config.virtual_models.retain(|vm| vm.id != id);
            Ok((name.clone(), vec![name]))
        })?;
        info!(virtual_model = %name, "Virtual model removed");
        Ok(())
    }

    /// Rename a virtual model
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` when the new name is taken by another model
    pub fn rename_virtual_model(&self, id: &str, new_name: &str) -> GatewayResult<()> {
        let new_name = new_name.trim();
        self.mutate(|config| {
            if new_name.is_empty() {
                return Err(GatewayError::validation("virtual model name must not be empty", Some("name".into()), "invalid_name"));
            }
            if config.find(new_name).is_some_and(|other| other.id != id) {
                return Err(GatewayError::validation(
                    format!("virtual model {new_name} already exists"),
                    Some("name".into()),
                    "duplicate_name",
                ));
            }
            let vm = config.by_id_mut(id).ok_or_else(|| not_found("virtual model", id))?;
            let old = std::mem::replace(&mut vm.name, new_name.to_string());
            Ok(((), vec![old, new_name.to_string()]))
        })
    }

    /// Enable or disable a virtual model
    ///
    /// # Errors
    /// Returns a 404 `GatewayError::Dispatch` for an unknown id
    pub fn set_virtual_model_enabled(&self, id: &str, enabled: bool) -> GatewayResult<()> {
        self.mutate(|config| {
            let vm = config.by_id_mut(id).ok_or_else(|| not_found("virtual model", id))?;
            vm.is_enabled = enabled;
            let invalidated = if enabled { Vec::new() } else { vec![vm.name.clone()] };
            Ok(((), invalidated))
        })
    }

    /// Append a fallback entry
    ///
    /// # Errors
    /// Returns a 404 `GatewayError::Dispatch` for an unknown virtual model
    pub fn add_fallback_entry(&self, vm_id: &str, provider: &str, model_id: &str) -> GatewayResult<FallbackEntry> {
        self.mutate(|config| {
            let vm = config.by_id_mut(vm_id).ok_or_else(|| not_found("virtual model", vm_id))?;
            let entry = vm.add_entry(provider, model_id).clone();
            Ok((entry, Vec::new()))
        })
    }

    /// Remove a fallback entry
    ///
    /// # Errors
    /// Returns a 404 `GatewayError::Dispatch` for an unknown model or entry
    pub fn remove_fallback_entry(&self, vm_id: &str, entry_id: &str) -> GatewayResult<()> {
        self.mutate(|config| {
            let vm = config.by_id_mut(vm_id).ok_or_else(|| not_found("virtual model", vm_id))?;
            if !vm.remove_entry(entry_id) {
                return Err(not_found("fallback entry", entry_id));
            }
            Ok(((), vec![vm.name.clone()]))
        })
    }

    /// Reorder fallback entries
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` unless `ordered_ids` lists every entry once
    pub fn reorder_fallback_entries(&self, vm_id: &str, ordered_ids: &[String]) -> GatewayResult<()> {
        self.mutate(|config| {
            let vm = config.by_id_mut(vm_id).ok_or_else(|| not_found("virtual model", vm_id))?;
            vm.reorder_entries(ordered_ids)?;
            Ok(((), vec![vm.name.clone()]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route_state::ActiveRoute;

    fn open(path: &Path) -> FallbackStore {
        FallbackStore::open(path, Arc::new(EntryCache::default()), Arc::new(RouteState::new())).unwrap()
    }

    #[test]
    fn test_missing_file_starts_empty_and_saves_on_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fallback.json");
        let store = open(&path);
        assert!(!store.config().is_enabled);
        assert!(!path.exists());

        store.set_enabled(true).unwrap();
        let vm = store.add_virtual_model("smart").unwrap();
        store.add_fallback_entry(&vm.id, "anthropic", "claude-3-5-sonnet").unwrap();

        let reopened = open(&path);
        let config = reopened.config();
        assert!(config.is_enabled);
        assert_eq!(config.find("SMART").unwrap().fallback_entries.len(), 1);
        assert!(!path.with_extension("json.tmp").exists());

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw["virtualModels"][0]["fallbackEntries"][0]["modelId"].is_string());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let store = FallbackStore::in_memory(
            FallbackConfig::default(),
            Arc::new(EntryCache::default()),
            Arc::new(RouteState::new()),
        );
        let first = store.add_virtual_model("smart").unwrap();
        assert!(store.add_virtual_model("Smart").is_err());
        let second = store.add_virtual_model("fast").unwrap();
        assert!(store.rename_virtual_model(&second.id, "SMART").is_err());
        store.rename_virtual_model(&first.id, "Smart").unwrap();
    }

    fn active_route(name: &str) -> ActiveRoute {
        ActiveRoute {
            virtual_model: name.to_string(),
            entry_id: format!("{name}-entry"),
            provider: "openai".to_string(),
            model_id: "gpt-4o".to_string(),
            entry_index: 1,
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_removal_and_disable_invalidate_cache_and_routes() {
        let cache = Arc::new(EntryCache::default());
        let routes = Arc::new(RouteState::new());
        let store = FallbackStore::in_memory(FallbackConfig::default(), Arc::clone(&cache), Arc::clone(&routes));
        let smart = store.add_virtual_model("smart").unwrap();
        let fast = store.add_virtual_model("fast").unwrap();

        for name in ["smart", "fast"] {
            cache.insert(name, format!("{name}-entry"));
            routes.set(active_route(name));
        }

        store.set_virtual_model_enabled(&fast.id, false).unwrap();
        assert!(cache.get("fast").is_none());
        assert!(routes.get("fast").is_none());
        assert!(routes.get("smart").is_some());

        store.remove_virtual_model(&smart.id).unwrap();
        assert!(cache.get("smart").is_none());
        assert!(routes.get("smart").is_none());
        assert!(store.config().find("smart").is_none());
        assert!(store.remove_virtual_model(&smart.id).is_err());
    }

    #[test]
    fn test_rename_invalidates_old_and_new_names() {
        let cache = Arc::new(EntryCache::default());
        let routes = Arc::new(RouteState::new());
        let store = FallbackStore::in_memory(FallbackConfig::default(), Arc::clone(&cache), Arc::clone(&routes));
        let vm = store.add_virtual_model("smart").unwrap();

        for name in ["smart", "clever"] {
            cache.insert(name, format!("{name}-entry"));
            routes.set(active_route(name));
        }

        store.rename_virtual_model(&vm.id, "clever").unwrap();
        for name in ["smart", "clever"] {
            assert!(cache.get(name).is_none());
            assert!(routes.get(name).is_none());
        }
        assert!(store.config().find("clever").is_some());
    }

    #[test]
    fn test_entry_operations_keep_priorities_contiguous() {
        let store = FallbackStore::in_memory(
            FallbackConfig::default(),
            Arc::new(EntryCache::default()),
            Arc::new(RouteState::new()),
        );
        let vm = store.add_virtual_model("smart").unwrap();
        let a = store.add_fallback_entry(&vm.id, "a", "m1").unwrap();
        let b = store.add_fallback_entry(&vm.id, "b", "m2").unwrap();
        let c = store.add_fallback_entry(&vm.id, "c", "m3").unwrap();

        store.remove_fallback_entry(&vm.id, &b.id).unwrap();
        store.reorder_fallback_entries(&vm.id, &[c.id.clone(), a.id.clone()]).unwrap();

        let config = store.config();
        let entries = config.find("smart").unwrap().sorted_entries();
        let view: Vec<(&str, u32)> = entries.iter().map(|e| (e.provider.as_str(), e.priority)).collect();
        assert_eq!(view, vec![("c", 1), ("a", 2)]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.json");
        std::fs::write(&path, "{oops").unwrap();
        let result = FallbackStore::open(&path, Arc::new(EntryCache::default()), Arc::new(RouteState::new()));
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }
}
