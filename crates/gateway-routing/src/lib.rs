//! # Gateway Routing
//!
//! Virtual models and transparent fallback for the LLM Relay Gateway.
//!
//! This crate provides:
//! - Virtual models mapped onto ordered (provider, model) fallback entries
//! - Per-request fallback contexts and trigger detection
//! - The TTL cache of winning entries and the operator-facing route state
//! - The persisted fallback document
//! - Model name to provider inference

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod context;
pub mod engine;
pub mod patch;
pub mod resolver;
pub mod route_state;
pub mod store;
pub mod trigger;
pub mod virtual_model;

// Re-export main types
pub use cache::{CachedEntryInfo, EntryCache, DEFAULT_CACHE_TTL};
pub use context::FallbackContext;
pub use engine::{FallbackEngine, FallbackSettings, DEFAULT_STREAM_INSPECTION_BYTES};
pub use patch::patch_model;
pub use resolver::{infer_providers, split_provider_prefix};
pub use route_state::{ActiveRoute, RouteState};
pub use store::FallbackStore;
pub use trigger::{should_trigger_fallback, should_trigger_for_error};
pub use virtual_model::{FallbackConfig, FallbackEntry, VirtualModel};
