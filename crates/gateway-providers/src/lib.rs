//! # Gateway Providers
//!
//! Upstream execution for the LLM Relay Gateway.
//!
//! This crate provides:
//! - The executor registry, one [`ProviderExecutor`](gateway_core::ProviderExecutor) per provider id
//! - A reqwest-backed HTTP executor for the OpenAI, Anthropic and Gemini wire formats
//! - The credential pool with per-provider round-robin selection
//! - Read-only token stores feeding the pool

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod credential_pool;
pub mod http;
pub mod registry;
pub mod token_store;

// Re-export main types
pub use credential_pool::{CredentialLease, CredentialPool, CredentialStats};
pub use http::HttpExecutor;
pub use registry::ExecutorRegistry;
pub use token_store::{FileTokenStore, StaticTokenStore};
