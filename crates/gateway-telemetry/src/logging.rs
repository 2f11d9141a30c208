//! Logging setup.
//!
//! A `RUST_LOG` filter in the environment wins over the configured level.

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (e.g. `info`, `gateway_dispatch=debug`)
    pub level: String,
    /// Output encoding
    pub format: LogFormat,
    /// Include the event target
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Set the level
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Switch to JSON output
    #[must_use]
    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    /// Filter to apply: `RUST_LOG` when set and valid, else the configured level
    ///
    /// # Errors
    /// Returns `TelemetryError::Filter` when the configured level does not parse
    pub fn filter(&self) -> Result<EnvFilter, TelemetryError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| TelemetryError::Filter(format!("{}: {e}", self.level))),
        }
    }
}

/// Install the global subscriber
///
/// # Errors
/// Returns error if the filter is invalid or a subscriber is already installed
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = config.filter()?;

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    info!(level = %config.level, format = ?config.format, "Logging initialized");
    Ok(())
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to install the subscriber
    #[error("Failed to initialize logging: {0}")]
    Init(String),
    /// Invalid filter directive
    #[error("Invalid log filter: {0}")]
    Filter(String),
}

/// Create the span covering one inbound dispatch
#[macro_export]
macro_rules! dispatch_span {
    ($request_id:expr, $model:expr, $format:expr) => {
        tracing::info_span!(
            "dispatch",
            request_id = %$request_id,
            model = %$model,
            format = %$format
        )
    };
}

/// Create the span covering one upstream attempt
#[macro_export]
macro_rules! attempt_span {
    ($provider:expr, $model:expr) => {
        tracing::debug_span!(
            "upstream_attempt",
            provider = %$provider,
            model = %$model
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = LoggingConfig::default().with_level("debug").json();
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: LoggingConfig = serde_json::from_str(r#"{"format":"json"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggingConfig::default().with_level("gateway=verbose");
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(config.filter().is_err());
        }
    }

    #[test]
    fn test_span_macros_expand() {
        let dispatch = crate::dispatch_span!("req-1", "gpt-4o", "openai");
        let attempt = crate::attempt_span!("openai", "gpt-4o");
        drop((dispatch, attempt));
    }
}
