//! # Gateway Server
//!
//! HTTP surface of the relay gateway.
//!
//! This crate provides:
//! - `/v1/chat/completions` (OpenAI dialect) and `/v1/messages` (Anthropic dialect)
//! - Model listing, health and version endpoints
//! - Admin endpoints for providers and virtual-model fallback
//! - Graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod state;

// Re-export main types
pub use error::ApiError;
pub use extractors::{ProviderHint, RequestId};
pub use routes::create_router;
pub use server::{Server, ServerError};
pub use shutdown::shutdown_signal;
pub use state::{AppState, AppStateBuilder};
