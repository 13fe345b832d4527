//! Secret-variable backends and the scheme registry that selects them.
//!
//! A variable is addressed by a URL-like locator (`file:///etc/app.pem`,
//! `env://APP_KEY`, `keyring://app-key`,
//! `awssecretsmanager://app-key?region=us-east-1`,
//! `gcpsecretmanager://projects/acme/secrets/app-key`).  The scheme is resolved to
//! a backend once, when configuration is loaded; each read then opens a
//! handle, takes its latest value and closes it again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};
use google_cloud_secretmanager_v1::client::SecretManagerService;
use url::Url;

use crate::error::CacheError;

use super::keyring::{self, Ring};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A source of secret variables for one locator scheme.
#[async_trait]
pub trait VariableBackend: Send + Sync {
    async fn open(&self, locator: &Url) -> Result<Box<dyn VariableHandle>>;
}

/// An open subscription to one variable.
#[async_trait]
pub trait VariableHandle: Send {
    /// The value of the variable at call time.
    async fn latest(&mut self) -> Result<Vec<u8>>;

    /// Release whatever the backend holds for this handle.
    async fn close(self: Box<Self>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps locator schemes to backends.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn VariableBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `file`, `env`, `keyring`,
    /// `awssecretsmanager` and `gcpsecretmanager` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file", Arc::new(FileBackend));
        registry.register("env", Arc::new(EnvBackend));
        registry.register("keyring", Arc::new(KeyringBackend));
        registry.register("awssecretsmanager", Arc::new(AwsSecretsManagerBackend));
        registry.register("gcpsecretmanager", Arc::new(GcpSecretManagerBackend));
        registry
    }

    pub fn register(&mut self, scheme: &str, backend: Arc<dyn VariableBackend>) {
        self.backends.insert(scheme.to_ascii_lowercase(), backend);
    }

    /// Parse `locator` and bind it to the backend for its scheme.
    pub fn resolve(&self, locator: &str) -> Result<ResolvedVariable, CacheError> {
        let url = Url::parse(locator)
            .map_err(|e| CacheError::Config(format!("invalid key secret locator: {e}")))?;
        let backend = self.backends.get(url.scheme()).cloned().ok_or_else(|| {
            CacheError::Config(format!(
                "no secret backend registered for scheme '{}'",
                url.scheme()
            ))
        })?;
        Ok(ResolvedVariable {
            locator: url,
            backend,
        })
    }
}

/// A locator already bound to its backend.
#[derive(Clone)]
pub struct ResolvedVariable {
    locator: Url,
    backend: Arc<dyn VariableBackend>,
}

impl std::fmt::Debug for ResolvedVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedVariable")
            .field("scheme", &self.locator.scheme())
            .finish_non_exhaustive()
    }
}

impl ResolvedVariable {
    pub fn scheme(&self) -> &str {
        self.locator.scheme()
    }

    /// Open the variable, read its latest value and close it.  The handle is
    /// closed whether or not the read succeeded.
    #[instrument(skip(self), fields(scheme = %self.locator.scheme()))]
    pub async fn read_latest(&self) -> Result<Vec<u8>> {
        let mut handle = self.backend.open(&self.locator).await?;
        let latest = handle.latest().await;
        if let Err(e) = handle.close().await {
            warn!(error = %e, "failed to close secret variable handle");
        }
        let value = latest?;
        debug!(bytes = value.len(), "read secret variable");
        Ok(value)
    }
}

/// The variable name carried by a locator: the host for `scheme://NAME`, or
/// the path for `scheme:NAME` / `scheme:///NAME`.
fn variable_name(locator: &Url) -> Result<String> {
    let name = match locator.host_str() {
        Some(host) if !host.is_empty() => {
            format!("{host}{}", locator.path())
        }
        _ => locator.path().trim_start_matches('/').to_string(),
    };
    if name.is_empty() {
        bail!("locator '{}' names no variable", locator.scheme());
    }
    Ok(name)
}

// ---------------------------------------------------------------------------
// file://
// ---------------------------------------------------------------------------

/// Reads the whole file on every `latest`.
pub struct FileBackend;

struct FileHandle {
    path: PathBuf,
}

#[async_trait]
impl VariableBackend for FileBackend {
    async fn open(&self, locator: &Url) -> Result<Box<dyn VariableHandle>> {
        let path = locator
            .to_file_path()
            .map_err(|()| anyhow::anyhow!("file locator is not an absolute path"))?;
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("secret file {} is not accessible", path.display()))?;
        if !meta.is_file() {
            bail!("secret file {} is not a regular file", path.display());
        }
        Ok(Box::new(FileHandle { path }))
    }
}

#[async_trait]
impl VariableHandle for FileHandle {
    async fn latest(&mut self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read secret file {}", self.path.display()))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// env://
// ---------------------------------------------------------------------------

/// Reads an environment variable of the running process.
pub struct EnvBackend;

struct EnvHandle {
    name: String,
}

#[async_trait]
impl VariableBackend for EnvBackend {
    async fn open(&self, locator: &Url) -> Result<Box<dyn VariableHandle>> {
        Ok(Box::new(EnvHandle {
            name: variable_name(locator)?,
        }))
    }
}

#[async_trait]
impl VariableHandle for EnvHandle {
    async fn latest(&mut self) -> Result<Vec<u8>> {
        std::env::var_os(&self.name)
            .map(|v| v.into_encoded_bytes())
            .with_context(|| format!("environment variable {} is not set", self.name))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// keyring://
// ---------------------------------------------------------------------------

/// Reads a `user` key from a Linux kernel keyring.  `?ring=` selects
/// `session` (default), `user` or `process`.
pub struct KeyringBackend;

struct KeyringHandle {
    ring: Ring,
    description: String,
}

#[async_trait]
impl VariableBackend for KeyringBackend {
    async fn open(&self, locator: &Url) -> Result<Box<dyn VariableHandle>> {
        let ring = match locator.query_pairs().find(|(k, _)| k == "ring") {
            Some((_, v)) => v.parse()?,
            None => Ring::default(),
        };
        Ok(Box::new(KeyringHandle {
            ring,
            description: variable_name(locator)?,
        }))
    }
}

#[async_trait]
impl VariableHandle for KeyringHandle {
    async fn latest(&mut self) -> Result<Vec<u8>> {
        keyring::read_key(self.ring, &self.description).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// awssecretsmanager://
// ---------------------------------------------------------------------------

/// AWS Secrets Manager.  `?region=` overrides the ambient AWS region.
pub struct AwsSecretsManagerBackend;

struct AwsSecretHandle {
    client: aws_sdk_secretsmanager::Client,
    secret_id: String,
}

#[async_trait]
impl VariableBackend for AwsSecretsManagerBackend {
    async fn open(&self, locator: &Url) -> Result<Box<dyn VariableHandle>> {
        let secret_id = variable_name(locator)?;
        let region = locator
            .query_pairs()
            .find(|(k, _)| k == "region")
            .map(|(_, v)| v.into_owned());

        let mut loader = aws_config::from_env();
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let aws_config = loader.load().await;

        Ok(Box::new(AwsSecretHandle {
            client: aws_sdk_secretsmanager::Client::new(&aws_config),
            secret_id,
        }))
    }
}

#[async_trait]
impl VariableHandle for AwsSecretHandle {
    async fn latest(&mut self) -> Result<Vec<u8>> {
        let out = self
            .client
            .get_secret_value()
            .secret_id(&self.secret_id)
            .send()
            .await
            .with_context(|| format!("GetSecretValue failed for {}", self.secret_id))?;

        if let Some(blob) = out.secret_binary() {
            return Ok(blob.as_ref().to_vec());
        }
        if let Some(s) = out.secret_string() {
            return Ok(s.as_bytes().to_vec());
        }
        bail!("secret {} has neither a string nor a binary value", self.secret_id)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// gcpsecretmanager://
// ---------------------------------------------------------------------------

/// Google Cloud Secret Manager.  The locator names the secret as
/// `projects/<project>/secrets/<secret>`, optionally with `/versions/<v>`;
/// without a version the latest one is read.  Credentials come from the
/// ambient Application Default Credentials.
pub struct GcpSecretManagerBackend;

struct GcpSecretHandle {
    client: SecretManagerService,
    version: String,
}

/// Full secret version resource name for a `gcpsecretmanager://` locator.
fn gcp_secret_version(locator: &Url) -> Result<String> {
    let name = variable_name(locator)?;
    let name = name.trim_end_matches('/');
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "secrets", secret]
            if !project.is_empty() && !secret.is_empty() =>
        {
            Ok(format!("{name}/versions/latest"))
        }
        ["projects", project, "secrets", secret, "versions", version]
            if !project.is_empty() && !secret.is_empty() && !version.is_empty() =>
        {
            Ok(name.to_string())
        }
        _ => bail!("'{name}' is not of the form projects/<project>/secrets/<secret>"),
    }
}

#[async_trait]
impl VariableBackend for GcpSecretManagerBackend {
    async fn open(&self, locator: &Url) -> Result<Box<dyn VariableHandle>> {
        let version = gcp_secret_version(locator)?;
        let client = SecretManagerService::builder()
            .build()
            .await
            .context("failed to build GCP Secret Manager client")?;
        Ok(Box::new(GcpSecretHandle { client, version }))
    }
}

#[async_trait]
impl VariableHandle for GcpSecretHandle {
    async fn latest(&mut self) -> Result<Vec<u8>> {
        let response = self
            .client
            .access_secret_version()
            .set_name(&self.version)
            .send()
            .await
            .with_context(|| format!("AccessSecretVersion failed for {}", self.version))?;

        match response.payload {
            Some(payload) => Ok(payload.data.to_vec()),
            None => bail!("secret version {} has no payload", self.version),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
