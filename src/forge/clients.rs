//! Per-installation API client cache.
//!
//! [`InstallationClients`] hands out one [`ApiClient`] per installation ID
//! (`0` for the app itself) and keeps it until [`free`](InstallationClients::free)
//! is called.  Construction is single-flight per installation: concurrent
//! callers for the same ID share one transport chain, callers for different
//! IDs never wait on each other.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};
use url::Url;

use crate::cache::keyed::{KeyedSlots, Lookup};
use crate::config::GitHubConfig;
use crate::credentials::{BackendRegistry, KeyFetcher, KeyProvider, SigningKey};
use crate::error::CacheError;
use crate::metrics::{Metrics, ScopeKind, ScopeLabels};

use super::app_auth::{GitHubTransportBuilder, TransportBuilder};
use super::client::ApiClient;
use super::transport::{HttpTransport, Transport};
use super::{InstallationId, Scope};

/// The operations policy code needs from a client cache.
#[async_trait]
pub trait ClientCache: Send + Sync {
    async fn get(&self, installation_id: InstallationId) -> Result<Arc<ApiClient>, CacheError>;
    fn free(&self, installation_id: InstallationId);
}

pub struct InstallationClients {
    key_fetcher: Arc<dyn KeyFetcher>,
    builder: Arc<dyn TransportBuilder>,
    base: Arc<dyn Transport>,
    api_url: Url,
    key: OnceCell<SigningKey>,
    clients: KeyedSlots<InstallationId, Arc<ApiClient>>,
    metrics: Option<Arc<Metrics>>,
}

impl InstallationClients {
    pub fn new(
        key_fetcher: Arc<dyn KeyFetcher>,
        builder: Arc<dyn TransportBuilder>,
        base: Arc<dyn Transport>,
        api_url: Url,
    ) -> Self {
        Self {
            key_fetcher,
            builder,
            base,
            api_url,
            key: OnceCell::new(),
            clients: KeyedSlots::new(),
            metrics: None,
        }
    }

    /// Wire the cache up from configuration: key provider bound to its
    /// secret backend, GitHub transport builder, reqwest base transport.
    pub fn from_config(
        config: &GitHubConfig,
        registry: &BackendRegistry,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, CacheError> {
        let api_url = Url::parse(&config.api_url)
            .map_err(|e| CacheError::Config(format!("invalid api_url: {e}")))?;
        let key_provider = KeyProvider::from_config(config, registry)?;
        let mut builder = GitHubTransportBuilder::new(config.app_id, api_url.clone());
        if let Some(metrics) = &metrics {
            builder = builder.with_metrics(Arc::clone(metrics));
        }
        let base = HttpTransport::new(&config.user_agent)?;

        let mut clients = Self::new(
            Arc::new(key_provider),
            Arc::new(builder),
            Arc::new(base),
            api_url,
        );
        clients.metrics = metrics;
        Ok(clients)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The signing key, fetched on first use and kept for the life of the
    /// cache.  A failed fetch is retried by the next caller.
    async fn signing_key(&self) -> Result<SigningKey, CacheError> {
        self.key
            .get_or_try_init(|| self.key_fetcher.get_key())
            .await
            .cloned()
    }

    async fn build_client(&self, installation_id: InstallationId) -> Result<Arc<ApiClient>, CacheError> {
        let key = self.signing_key().await?;
        let scope = Scope::for_installation(installation_id);
        let transport = self.builder.build(scope, &key, Arc::clone(&self.base))?;

        if let Some(metrics) = &self.metrics {
            let kind = match scope {
                Scope::Application => ScopeKind::Application,
                Scope::Installation(_) => ScopeKind::Installation,
            };
            metrics
                .transport_constructions
                .get_or_create(&ScopeLabels { scope: kind })
                .inc();
        }

        Ok(Arc::new(ApiClient::new(
            transport,
            self.api_url.clone(),
            scope,
        )))
    }

    /// The client for `installation_id`, building it on first request.
    #[instrument(skip(self))]
    pub async fn get(&self, installation_id: InstallationId) -> Result<Arc<ApiClient>, CacheError> {
        let (client, lookup) = self
            .clients
            .get_or_try_init(&installation_id, || self.build_client(installation_id))
            .await?;

        match lookup {
            Lookup::Hit => {
                debug!("installation client cache hit");
                if let Some(metrics) = &self.metrics {
                    metrics.client_cache_hits.inc();
                }
            }
            Lookup::Built => {
                info!(scope = %client.scope(), "cached new installation client");
                if let Some(metrics) = &self.metrics {
                    metrics.client_cache_misses.inc();
                    metrics.clients_cached.set(self.clients.len() as i64);
                }
            }
        }
        Ok(client)
    }

    /// Drop the cached client for `installation_id`, if any.
    #[instrument(skip(self))]
    pub fn free(&self, installation_id: InstallationId) {
        if self.clients.remove(&installation_id).is_some() {
            debug!("freed installation client");
        }
        if let Some(metrics) = &self.metrics {
            metrics.clients_cached.set(self.clients.len() as i64);
        }
    }

    /// Number of clients currently cached.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[async_trait]
impl ClientCache for InstallationClients {
    async fn get(&self, installation_id: InstallationId) -> Result<Arc<ApiClient>, CacheError> {
        InstallationClients::get(self, installation_id).await
    }

    fn free(&self, installation_id: InstallationId) {
        InstallationClients::free(self, installation_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
