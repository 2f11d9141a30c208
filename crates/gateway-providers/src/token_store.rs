//! Read-only token stores.
//!
//! [`StaticTokenStore`] serves keys supplied through configuration.
//! [`FileTokenStore`] reads a directory of JSON auth files written by an
//! external login tool; it never writes back.

use async_trait::async_trait;
use gateway_core::{Credential, GatewayError, GatewayResult, TokenStore};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Token store over a fixed credential list
#[derive(Debug, Clone, Default)]
pub struct StaticTokenStore {
    credentials: Vec<Credential>,
}

impl StaticTokenStore {
    /// Create a store serving `credentials`
    #[must_use]
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl TokenStore for StaticTokenStore {
    async fn list_auth_files(&self) -> GatewayResult<Vec<Credential>> {
        Ok(self.credentials.clone())
    }
}

/// On-disk auth file layout.
///
/// Login tools disagree on field names, so the common spellings are accepted.
#[derive(Debug, Deserialize)]
struct AuthFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "type")]
    provider: String,
    #[serde(alias = "access_token", alias = "key")]
    api_key: SecretString,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default, alias = "email")]
    label: Option<String>,
    #[serde(default)]
    disabled: bool,
}

impl AuthFile {
    fn into_credential(self, fallback_id: &str) -> Credential {
        Credential {
            id: self.id.unwrap_or_else(|| fallback_id.to_string()),
            provider: self.provider.to_ascii_lowercase(),
            api_key: self.api_key,
            base_url: self.base_url,
            label: self.label,
            disabled: self.disabled,
        }
    }
}

/// Token store reading `*.json` auth files from a directory
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    /// Create a store over `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being read
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_file(path: &Path) -> Option<Credential> {
        let stem = path.file_stem()?.to_string_lossy().into_owned();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable auth file");
                return None;
            }
        };
        match serde_json::from_slice::<AuthFile>(&raw) {
            Ok(file) => Some(file.into_credential(&stem)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed auth file");
                None
            }
        }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn list_auth_files(&self) -> GatewayResult<Vec<Credential>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            GatewayError::configuration(format!(
                "cannot read auth directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GatewayError::internal(format!("auth directory listing failed: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut credentials = Vec::with_capacity(paths.len());
        for path in &paths {
            if let Some(credential) = Self::read_file(path).await {
                credentials.push(credential);
            }
        }
        debug!(dir = %self.dir.display(), count = credentials.len(), "Loaded auth files");
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn test_static_store() {
        let store = StaticTokenStore::new(vec![Credential::new("k1", "openai", "sk")]);
        let listed = store.list_auth_files().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.get("k1").await.unwrap().is_some());
        assert!(store.get("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_reads_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("claude-work.json"),
            r#"{"type":"Anthropic","access_token":"tok","email":"me@example.com"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("gemini.json"),
            r#"{"id":"g","provider":"gemini","api_key":"key","base_url":"http://localhost:1"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = FileTokenStore::new(dir.path());
        let credentials = store.list_auth_files().await.unwrap();
        assert_eq!(credentials.len(), 2);

        let claude = &credentials[0];
        assert_eq!(claude.id, "claude-work");
        assert_eq!(claude.provider, "anthropic");
        assert_eq!(claude.api_key.expose_secret(), "tok");
        assert_eq!(claude.label.as_deref(), Some("me@example.com"));

        let gemini = &credentials[1];
        assert_eq!(gemini.id, "g");
        assert_eq!(gemini.base_url.as_deref(), Some("http://localhost:1"));
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let store = FileTokenStore::new("/nonexistent/auth/dir");
        let err = store.list_auth_files().await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }
}
