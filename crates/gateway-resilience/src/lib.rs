//! # Gateway Resilience
//!
//! Resilience patterns for the LLM Relay Gateway:
//! - Circuit breaker (per route, with a registry) for gating failing upstreams
//! - Retry policy with exponential backoff, jitter and `Retry-After` support
//! - Timeouts and deadlines with cancellation propagation
//!
//! None of these know about providers; the dispatcher composes them as
//! `breaker(retry(timeout(call)))`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

// Re-export main types
pub use circuit_breaker::{
    counts_as_failure, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState,
};
pub use retry::{with_retry, RetryConfig, RetryPolicy};
pub use timeout::{with_timeout, with_timeout_signal, Deadline, TimeoutConfig};
