//! # Gateway Core
//!
//! Core types, traits, and error handling for the LLM Relay Gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - The unified, format-neutral message model
//! - Wire format identifiers
//! - The error taxonomy
//! - Provider executor and token store seams

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod credential;
pub mod error;
pub mod executor;
pub mod format;
pub mod message;

// Re-export commonly used types
pub use credential::{Credential, TokenStore};
pub use error::{GatewayError, GatewayResult, NetworkErrorKind};
pub use executor::{ChunkStream, ExecutorRequest, ProviderExecutor};
pub use format::ApiFormat;
pub use message::{
    ContentBlock, DeltaPayload, ImageSource, MessageContent, Role, StopReason, StreamDelta,
    StreamDeltaType, ToolDefinition, UnifiedMessage, UnifiedRequest, UnifiedResponse, Usage,
};
