//! Active route per virtual model, as shown to operators.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// The entry currently serving a virtual model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRoute {
    /// Virtual model name as configured
    pub virtual_model: String,
    /// Serving entry id
    pub entry_id: String,
    /// Serving provider
    pub provider: String,
    /// Serving concrete model
    pub model_id: String,
    /// Position of the entry in priority order
    pub entry_index: usize,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

/// Map of virtual model name (case-insensitive) to its active route
#[derive(Debug, Default)]
pub struct RouteState {
    routes: DashMap<String, ActiveRoute>,
}

impl RouteState {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the active route
    pub fn set(&self, route: ActiveRoute) {
        self.routes
            .insert(route.virtual_model.to_ascii_lowercase(), route);
    }

    /// Active route of a virtual model
    #[must_use]
    pub fn get(&self, virtual_model: &str) -> Option<ActiveRoute> {
        self.routes
            .get(&virtual_model.to_ascii_lowercase())
            .map(|r| r.value().clone())
    }

    /// Drop the route of a virtual model
    pub fn remove(&self, virtual_model: &str) {
        self.routes.remove(&virtual_model.to_ascii_lowercase());
    }

    /// Drop everything
    pub fn clear(&self) {
        self.routes.clear();
    }

    /// All routes sorted by virtual model name
    #[must_use]
    pub fn snapshot(&self) -> Vec<ActiveRoute> {
        let mut routes: Vec<ActiveRoute> = self.routes.iter().map(|r| r.value().clone()).collect();
        routes.sort_by(|a, b| a.virtual_model.cmp(&b.virtual_model));
        routes
    }
}
