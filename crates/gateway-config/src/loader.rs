//! Configuration loading.
//!
//! Order of precedence, lowest first: built-in defaults, the config file,
//! `GATEWAY_*` environment overrides.

use crate::error::ConfigError;
use crate::gateway::GatewayConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Variable naming the config file
pub const ENV_CONFIG: &str = "GATEWAY_CONFIG";
/// Bind host override
pub const ENV_HOST: &str = "GATEWAY_HOST";
/// Bind port override
pub const ENV_PORT: &str = "GATEWAY_PORT";
/// Log level override
pub const ENV_LOG_LEVEL: &str = "GATEWAY_LOG_LEVEL";
/// Fallback document path override
pub const ENV_FALLBACK_CONFIG: &str = "GATEWAY_FALLBACK_CONFIG";
/// Auth file directory override
pub const ENV_AUTH_DIR: &str = "GATEWAY_AUTH_DIR";

/// Config file encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.toml`
    Toml,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// Format implied by a file extension
    ///
    /// # Errors
    /// Returns `ConfigError::UnsupportedFormat` for any other extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::UnsupportedFormat(if other.is_empty() {
                path.display().to_string()
            } else {
                other.to_string()
            })),
        }
    }

    /// Parse a document in this format
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` when the content does not match the schema
    pub fn parse(self, path: &Path, content: &str) -> Result<GatewayConfig, ConfigError> {
        if content.trim().is_empty() {
            return Ok(GatewayConfig::default());
        }
        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        match self {
            Self::Yaml => serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string())),
            Self::Toml => toml::from_str(content).map_err(|e| parse_error(e.to_string())),
            Self::Json => serde_json::from_str(content).map_err(|e| parse_error(e.to_string())),
        }
    }
}

/// Builder that assembles a [`GatewayConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl ConfigLoader {
    /// Loader with no file and no overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader driven by the process environment: the file named by
    /// `GATEWAY_CONFIG` plus every `GATEWAY_*` override
    #[must_use]
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("GATEWAY_"))
            .collect();
        let file = env.get(ENV_CONFIG).filter(|v| !v.is_empty()).map(PathBuf::from);
        Self { file, env }
    }

    /// Read this config file
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Apply an override as if it were set in the environment
    #[must_use]
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Load, apply overrides, validate
    ///
    /// # Errors
    /// Returns a `ConfigError` when the file cannot be read or parsed, an
    /// override is malformed, or the result fails validation
    pub async fn load(self) -> Result<GatewayConfig, ConfigError> {
        let mut config = match &self.file {
            Some(path) => {
                let format = ConfigFormat::from_path(path)?;
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })?;
                let config = format.parse(path, &content)?;
                info!(path = %path.display(), ?format, "Loaded configuration file");
                config
            }
            None => {
                debug!("No configuration file, using defaults");
                GatewayConfig::default()
            }
        };

        self.apply_overrides(&mut config)?;
        config.check()?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut GatewayConfig) -> Result<(), ConfigError> {
        if let Some(host) = self.var(ENV_HOST) {
            config.server.host = host.to_string();
        }
        if let Some(port) = self.var(ENV_PORT) {
            config.server.port = port.parse().map_err(|e| ConfigError::Env {
                var: ENV_PORT.to_string(),
                message: format!("{port:?}: {e}"),
            })?;
        }
        if let Some(level) = self.var(ENV_LOG_LEVEL) {
            config.logging.level = level.to_string();
        }
        if let Some(path) = self.var(ENV_FALLBACK_CONFIG) {
            config.fallback.config_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = self.var(ENV_AUTH_DIR) {
            config.credentials.auth_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    fn var(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Load configuration from the process environment
///
/// # Errors
/// See [`ConfigLoader::load`]
pub async fn load_config() -> Result<GatewayConfig, ConfigError> {
    ConfigLoader::from_env().load().await
}
