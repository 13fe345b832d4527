use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::credentials::{BackendRegistry, DIRECT_KEY_SECRET};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub github: GitHubConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

// ---------------------------------------------------------------------------
// GitHub App
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub struct GitHubConfig {
    /// Numeric GitHub App ID, used as the JWT issuer.
    pub app_id: u64,
    /// Full URL to the API root (e.g. `https://ghe.corp.example.com/api/v3`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Host that `owner/name` repository locators are cloned from.
    #[serde(default = "default_git_host")]
    pub git_host: String,
    /// Either `direct` (use [`private_key`](Self::private_key)) or a secret
    /// locator such as `file:///etc/policybot/app.pem` or
    /// `awssecretsmanager://policybot-key?region=us-east-1`.
    #[serde(default = "default_key_secret")]
    pub key_secret: String,
    /// PEM-encoded app private key, only read when `key_secret` is `direct`.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("app_id", &self.app_id)
            .field("api_url", &self.api_url)
            .field("git_host", &self.git_host)
            .field("key_secret", &self.key_secret)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_git_host() -> String {
    "github.com".to_string()
}

fn default_key_secret() -> String {
    DIRECT_KEY_SECRET.to_string()
}

fn default_user_agent() -> String {
    concat!("policybot-cache/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Local working copies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Directory under which per-repository clone directories are created.
    #[serde(default = "default_clone_root")]
    pub clone_root: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            clone_root: default_clone_root(),
        }
    }
}

fn default_clone_root() -> PathBuf {
    std::env::temp_dir()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P, registry: &BackendRegistry) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents, registry)
        .with_context(|| format!("failed to load config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str, registry: &BackendRegistry) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML")?;
    validate_config(&config, registry)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config, registry: &BackendRegistry) -> Result<()> {
    anyhow::ensure!(config.github.app_id > 0, "github.app_id must be non-zero");
    url::Url::parse(&config.github.api_url)
        .with_context(|| format!("github.api_url is not a URL: {}", config.github.api_url))?;
    anyhow::ensure!(
        !config.github.git_host.is_empty(),
        "github.git_host must not be empty"
    );
    if config.github.key_secret == DIRECT_KEY_SECRET {
        anyhow::ensure!(
            config.github.private_key.as_deref().is_some_and(|k| !k.is_empty()),
            "github.private_key is required when key_secret is 'direct'"
        );
    } else {
        registry.resolve(&config.github.key_secret)?;
    }
    Ok(())
}
