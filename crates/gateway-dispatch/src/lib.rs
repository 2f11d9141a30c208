//! # Gateway Dispatch
//!
//! The proxy dispatcher: the single entry point the HTTP surface calls.
//!
//! A dispatch resolves the providers for a request, translates the payload
//! into each provider's wire format, selects a credential, runs the upstream
//! call through the circuit breaker, retry and timeout layers, and translates
//! the answer back. The `*_with_fallback` variants walk the fallback entries
//! of a virtual model until one succeeds.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatcher;
pub mod request;
pub mod stream;

// Re-export main types
pub use dispatcher::Dispatcher;
pub use request::{AvailableModel, DispatchRequest, DispatchResponse};
pub use stream::{DispatchStream, StreamMessage};
