//! The gateway configuration document.

use crate::error::ConfigError;
use gateway_core::ApiFormat;
use gateway_resilience::{CircuitBreakerConfig, RetryConfig, TimeoutConfig};
use gateway_routing::FallbackSettings;
use gateway_telemetry::LoggingConfig;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP listener
    #[validate(nested)]
    pub server: ServerConfig,
    /// Log output
    pub logging: LoggingConfig,
    /// Breaker, retry and timeout settings
    pub resilience: ResilienceConfig,
    /// Virtual-model fallback
    pub fallback: FallbackSettings,
    /// Upstream providers; the three built-in providers when empty
    #[validate(nested)]
    pub providers: Vec<ProviderConfig>,
    /// Where credentials come from
    #[validate(nested)]
    pub credentials: CredentialsConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    #[validate(length(min = 1))]
    pub host: String,
    /// Bind port
    #[validate(range(min = 1))]
    pub port: u16,
    /// Overall budget for a non-streaming request, fallback included
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// `host:port`
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resilience settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retry policy
    pub retry: RetryConfig,
    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,
    /// Upstream timeouts
    pub timeouts: TimeoutConfig,
}

/// One upstream provider
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ProviderConfig {
    /// Provider id used for routing and credentials
    #[validate(length(min = 1))]
    pub id: String,
    /// Wire format the upstream speaks
    pub format: ApiFormat,
    /// Base URL; the format's public endpoint when unset
    #[serde(default)]
    pub base_url: Option<String>,
    /// Models served by this provider
    #[serde(default)]
    pub models: Vec<String>,
    /// Disabled providers are not registered
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    /// Provider with the format's public endpoint
    pub fn new(id: impl Into<String>, format: ApiFormat) -> Self {
        Self {
            id: id.into(),
            format,
            base_url: None,
            models: Vec::new(),
            enabled: true,
        }
    }

    /// One provider per supported wire format, named after it
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        ApiFormat::ALL
            .iter()
            .map(|format| Self::new(format.as_str(), *format))
            .collect()
    }
}

/// Credential sources
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Directory of JSON auth files
    pub auth_dir: Option<PathBuf>,
    /// Keys given inline
    #[validate(nested)]
    pub keys: Vec<CredentialKey>,
}

/// One inline credential
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CredentialKey {
    /// Credential id; `<provider>-<index>` when unset
    #[serde(default)]
    pub id: Option<String>,
    /// Provider the key belongs to
    #[validate(length(min = 1))]
    pub provider: String,
    /// Secret key
    pub api_key: SecretString,
    /// Base URL override for this key
    #[serde(default)]
    pub base_url: Option<String>,
}

impl GatewayConfig {
    /// Configured providers, or the built-in ones when none are configured
    #[must_use]
    pub fn effective_providers(&self) -> Vec<ProviderConfig> {
        if self.providers.is_empty() {
            ProviderConfig::builtin()
        } else {
            self.providers.clone()
        }
    }

    /// Check field constraints and cross-section consistency
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` describing the first problem found
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        let retry = &self.resilience.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "resilience.retry.max_attempts must be at least 1".into(),
            ));
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "resilience.retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if retry.initial_delay > retry.max_delay {
            return Err(ConfigError::Validation(
                "resilience.retry.initial_delay exceeds max_delay".into(),
            ));
        }

        let breaker = &self.resilience.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            return Err(ConfigError::Validation(
                "resilience.circuit_breaker thresholds must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&breaker.failure_rate_threshold) {
            return Err(ConfigError::Validation(
                "resilience.circuit_breaker.failure_rate_threshold must be within 0.0..=1.0".into(),
            ));
        }

        let timeouts = &self.resilience.timeouts;
        if timeouts.request.is_zero() || timeouts.stream_first_byte.is_zero() {
            return Err(ConfigError::Validation(
                "resilience.timeouts must be non-zero".into(),
            ));
        }
        if self.fallback.cache_ttl.is_zero() {
            return Err(ConfigError::Validation("fallback.cache_ttl must be non-zero".into()));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.to_ascii_lowercase()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate provider id {}",
                    provider.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.server.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.fallback.stream_inspection_bytes, 4096);
    }

    #[test]
    fn test_builtin_providers_when_none_configured() {
        let providers = GatewayConfig::default().effective_providers();
        let ids: Vec<&str> = providers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["openai", "anthropic", "gemini"]);
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let config = GatewayConfig {
            providers: vec![
                ProviderConfig::new("openai", ApiFormat::OpenAI),
                ProviderConfig::new("OpenAI", ApiFormat::OpenAI),
            ],
            ..GatewayConfig::default()
        };
        assert!(matches!(config.check(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = GatewayConfig::default();
        config.server.port = 0;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = GatewayConfig::default();
        config.resilience.retry.max_attempts = 0;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_empty_provider_id_rejected() {
        let config = GatewayConfig {
            providers: vec![ProviderConfig::new("", ApiFormat::Gemini)],
            ..GatewayConfig::default()
        };
        assert!(config.check().is_err());
    }
}
