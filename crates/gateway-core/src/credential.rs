//! Provider credentials and the read-only token store seam.

use crate::error::GatewayResult;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

/// A usable credential for one provider account
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    /// Unique credential identifier
    pub id: String,
    /// Provider this credential belongs to
    pub provider: String,
    /// Secret API key or access token
    pub api_key: SecretString,
    /// Per-account upstream base URL override
    #[serde(default)]
    pub base_url: Option<String>,
    /// Display label (account e-mail, key name)
    #[serde(default)]
    pub label: Option<String>,
    /// Disabled credentials are never selected
    #[serde(default)]
    pub disabled: bool,
}

impl Credential {
    /// Create an enabled credential
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            api_key: SecretString::new(api_key.into()),
            base_url: None,
            label: None,
            disabled: false,
        }
    }

    /// Set the base URL override
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// Source of already-resolved credentials.
///
/// Login flows, renewal and on-disk storage live behind this trait; the
/// gateway only ever reads from it.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// List every stored credential
    async fn list_auth_files(&self) -> GatewayResult<Vec<Credential>>;

    /// Look up a single credential by id
    async fn get(&self, id: &str) -> GatewayResult<Option<Credential>> {
        Ok(self
            .list_auth_files()
            .await?
            .into_iter()
            .find(|c| c.id == id))
    }
}
