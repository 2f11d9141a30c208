//! Error taxonomy shared by every gateway crate.
//!
//! Each variant knows the HTTP status it maps to and the envelope `type`
//! used when the server renders it back in the caller's wire format.

use crate::format::ApiFormat;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Classification of transport-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Peer reset the connection
    ConnectionReset,
    /// Peer refused the connection
    ConnectionRefused,
    /// Transport timed out before a response arrived
    Timeout,
    /// Host name could not be resolved
    Dns,
    /// Anything else the transport reported
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionReset => "connection reset",
            Self::ConnectionRefused => "connection refused",
            Self::Timeout => "timeout",
            Self::Dns => "dns failure",
            Self::Other => "network error",
        };
        f.write_str(s)
    }
}

/// Gateway error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Routing-level failure (no provider, no translator for a format)
    #[error("{message}")]
    Dispatch {
        /// HTTP status to surface
        status_code: u16,
        /// Human readable message
        message: String,
        /// Optional structured details
        details: Option<serde_json::Value>,
    },

    /// Upstream answered with a non-success HTTP status
    #[error("provider {provider} returned status {status_code}: {message}")]
    Status {
        /// Provider that produced the status
        provider: String,
        /// Upstream HTTP status
        status_code: u16,
        /// Upstream response body or message
        message: String,
        /// Value of the upstream `Retry-After` header, if any
        retry_after: Option<Duration>,
    },

    /// Circuit breaker rejected the call without touching the upstream
    #[error("circuit {circuit_id} is open, retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Breaker identifier (provider or provider:model)
        circuit_id: String,
        /// Milliseconds until the breaker will admit a trial request again
        retry_after_ms: u64,
    },

    /// Every retry attempt failed
    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: Box<GatewayError>,
    },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Budget that was exceeded
        timeout_ms: u64,
        /// Name of the operation that timed out
        operation: String,
    },

    /// Transport failure talking to an upstream
    #[error("{kind}: {message}")]
    Network {
        /// Failure class
        kind: NetworkErrorKind,
        /// Transport message
        message: String,
    },

    /// Payload could not be converted to or from a wire format
    #[error("cannot translate {format} payload: {message}")]
    Translation {
        /// Format being parsed or built
        format: ApiFormat,
        /// What went wrong
        message: String,
    },

    /// Inbound request failed validation
    #[error("{message}")]
    Validation {
        /// Error message
        message: String,
        /// Offending field
        field: Option<String>,
        /// Machine readable code
        code: String,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Caller went away before the operation completed
    #[error("request cancelled")]
    Cancelled,

    /// Unexpected internal failure
    #[error("internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl GatewayError {
    /// Create a dispatch error
    pub fn dispatch(status_code: u16, message: impl Into<String>) -> Self {
        Self::Dispatch {
            status_code,
            message: message.into(),
            details: None,
        }
    }

    /// Create an upstream status error
    pub fn status(provider: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            provider: provider.into(),
            status_code,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout: Duration, operation: impl Into<String>) -> Self {
        Self::Timeout {
            timeout_ms: timeout.as_millis() as u64,
            operation: operation.into(),
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    /// Create a translation error
    pub fn translation(format: ApiFormat, message: impl Into<String>) -> Self {
        Self::Translation {
            format,
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(
        message: impl Into<String>,
        field: Option<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            field,
            code: code.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code this error maps to
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Dispatch { status_code, .. } | Self::Status { status_code, .. } => *status_code,
            Self::CircuitOpen { .. } => 503,
            Self::RetryExhausted { last_error, .. } => last_error.status_code(),
            Self::Timeout { .. } => 504,
            Self::Network { .. } => 502,
            Self::Translation { .. } | Self::Validation { .. } => 400,
            Self::Cancelled => 499,
            Self::Configuration { .. } | Self::Internal { .. } => 500,
        }
    }

    /// Error `type` string used in OpenAI style envelopes
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self.root_cause() {
            Self::Validation { .. } | Self::Translation { .. } => "invalid_request_error",
            Self::Status { status_code, .. } | Self::Dispatch { status_code, .. } => {
                match *status_code {
                    400 | 404 | 422 => "invalid_request_error",
                    401 => "authentication_error",
                    403 => "permission_error",
                    429 => "rate_limit_error",
                    503 | 529 => "overloaded_error",
                    _ => "api_error",
                }
            }
            Self::CircuitOpen { .. } => "overloaded_error",
            Self::Timeout { .. } => "timeout_error",
            _ => "api_error",
        }
    }

    /// Body text of the innermost upstream failure, used for quota signal inspection
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match self.root_cause() {
            Self::Status { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }

    /// Unwrap retry exhaustion down to the error of the final attempt
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RetryExhausted { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }

    /// Upstream `Retry-After` hint, if the upstream sent one
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this is a transport-level failure
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Whether this error was produced by caller cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled)
    }
}
