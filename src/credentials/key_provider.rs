use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretSlice};
use tracing::{debug, instrument};

use crate::config::GitHubConfig;
use crate::error::CacheError;

use super::backends::{BackendRegistry, ResolvedVariable};

/// `key_secret` value meaning "the private key is in the config itself".
pub const DIRECT_KEY_SECRET: &str = "direct";

// ---------------------------------------------------------------------------
// Signing key
// ---------------------------------------------------------------------------

/// The app's private key material.  `Debug` never prints the bytes.
#[derive(Clone)]
pub struct SigningKey(Arc<SecretSlice<u8>>);

impl SigningKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(SecretSlice::from(bytes)))
    }

    pub fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn get_key(&self) -> Result<SigningKey, CacheError>;
}

#[derive(Debug, Clone)]
enum KeySource {
    Direct(SigningKey),
    Variable(ResolvedVariable),
}

/// Resolves the signing key from the configured source.
#[derive(Debug, Clone)]
pub struct KeyProvider {
    source: KeySource,
}

impl KeyProvider {
    /// Bind the configured key source.  A secret locator is resolved to its
    /// backend here, once.
    pub fn from_config(
        config: &GitHubConfig,
        registry: &BackendRegistry,
    ) -> Result<Self, CacheError> {
        if config.key_secret == DIRECT_KEY_SECRET {
            let key = config.private_key.as_deref().ok_or_else(|| {
                CacheError::Config("key_secret is 'direct' but private_key is not set".into())
            })?;
            return Ok(Self::direct(key.as_bytes().to_vec()));
        }
        Ok(Self {
            source: KeySource::Variable(registry.resolve(&config.key_secret)?),
        })
    }

    pub fn direct(key: Vec<u8>) -> Self {
        Self {
            source: KeySource::Direct(SigningKey::new(key)),
        }
    }

    fn source_name(&self) -> String {
        match &self.source {
            KeySource::Direct(_) => DIRECT_KEY_SECRET.to_string(),
            KeySource::Variable(var) => format!("{}:// backend", var.scheme()),
        }
    }
}

#[async_trait]
impl KeyFetcher for KeyProvider {
    #[instrument(skip(self), fields(source = %self.source_name()))]
    async fn get_key(&self) -> Result<SigningKey, CacheError> {
        let key = match &self.source {
            KeySource::Direct(key) => key.clone(),
            KeySource::Variable(var) => {
                let bytes = var
                    .read_latest()
                    .await
                    .map_err(|e| CacheError::key_unavailable(self.source_name(), e))?;
                SigningKey::new(bytes)
            }
        };
        if key.expose().is_empty() {
            return Err(CacheError::key_unavailable(
                self.source_name(),
                "signing key is empty",
            ));
        }
        debug!("signing key loaded");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github_config(key_secret: &str, private_key: Option<&str>) -> GitHubConfig {
        GitHubConfig {
            app_id: 1,
            api_url: "https://api.github.com".into(),
            git_host: "github.com".into(),
            key_secret: key_secret.into(),
            private_key: private_key.map(str::to_string),
            user_agent: "test".into(),
        }
    }

    #[tokio::test]
    async fn direct_key_is_returned_verbatim() {
        let config = github_config("direct", Some("PEM DATA"));
        let provider = KeyProvider::from_config(&config, &BackendRegistry::new()).unwrap();
        assert_eq!(provider.get_key().await.unwrap().expose(), b"PEM DATA");
    }

    #[test]
    fn direct_without_private_key_is_config_error() {
        let config = github_config("direct", None);
        let err = KeyProvider::from_config(&config, &BackendRegistry::new()).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[tokio::test]
    async fn variable_key_is_read_from_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pem");
        std::fs::write(&path, "FROM FILE").unwrap();

        let locator = url::Url::from_file_path(&path).unwrap();
        let config = github_config(locator.as_str(), None);
        let provider =
            KeyProvider::from_config(&config, &BackendRegistry::with_defaults()).unwrap();
        assert_eq!(provider.get_key().await.unwrap().expose(), b"FROM FILE");
    }

    #[tokio::test]
    async fn unreadable_variable_is_key_unavailable() {
        let config = github_config("file:///nonexistent/policybot/app.pem", None);
        let provider =
            KeyProvider::from_config(&config, &BackendRegistry::with_defaults()).unwrap();
        let err = provider.get_key().await.unwrap_err();
        assert!(matches!(err, CacheError::KeyUnavailable { .. }));
    }

    #[tokio::test]
    async fn empty_key_is_key_unavailable() {
        let provider = KeyProvider::direct(Vec::new());
        let err = provider.get_key().await.unwrap_err();
        assert!(matches!(err, CacheError::KeyUnavailable { .. }));
    }

    #[test]
    fn debug_redacts_key() {
        let key = SigningKey::new(b"super secret".to_vec());
        assert_eq!(format!("{key:?}"), "SigningKey(<redacted>)");
        let provider = KeyProvider::direct(b"super secret".to_vec());
        assert!(!format!("{provider:?}").contains("super secret"));
    }
}
