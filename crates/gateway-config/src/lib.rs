//! # Gateway Config
//!
//! Configuration for the LLM Relay Gateway.
//!
//! Configuration is read from a YAML, TOML or JSON file (named by
//! `GATEWAY_CONFIG` when loading from the environment), then `GATEWAY_*`
//! environment overrides are applied and the result is validated.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod gateway;
pub mod loader;

// Re-export main types
pub use error::ConfigError;
pub use gateway::{
    CredentialKey, CredentialsConfig, GatewayConfig, ProviderConfig, ResilienceConfig,
    ServerConfig,
};
pub use loader::{load_config, ConfigFormat, ConfigLoader};
