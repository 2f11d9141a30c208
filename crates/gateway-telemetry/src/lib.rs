//! # Gateway Telemetry
//!
//! Structured logging for the LLM Relay Gateway.
//!
//! This crate provides:
//! - Subscriber initialisation (human or JSON output, `RUST_LOG` aware)
//! - Span macros for dispatches and upstream attempts

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;

// Re-export main types
pub use logging::{init_logging, LogFormat, LoggingConfig, TelemetryError};
