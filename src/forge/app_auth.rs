//! GitHub App request authentication and transport assembly.
//!
//! [`AppTransport`] signs every request with a short-lived RS256 JWT issued
//! by the app itself.  [`InstallationTransport`] exchanges that JWT for an
//! installation access token and attaches the token instead, refreshing it
//! shortly before it expires.  [`GitHubTransportBuilder`] stacks either one
//! on top of the response cache and the base transport.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use url::Url;

use crate::credentials::SigningKey;
use crate::error::CacheError;
use crate::metrics::Metrics;

use super::http_cache::CachingTransport;
use super::transport::{endpoint, ApiRequest, ApiResponse, Transport};
use super::{InstallationId, Scope};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";

/// Backdate `iat` to tolerate clock drift between us and the API.
const JWT_BACKDATE_SECS: i64 = 60;
/// GitHub rejects app JWTs that live longer than ten minutes.
const JWT_LIFETIME_SECS: i64 = 9 * 60;
/// Installation tokens are refreshed this long before `expires_at`.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds the authenticated transport chain for one scope.
pub trait TransportBuilder: Send + Sync {
    fn build(
        &self,
        scope: Scope,
        key: &SigningKey,
        base: Arc<dyn Transport>,
    ) -> Result<Arc<dyn Transport>, CacheError>;
}

/// `auth(cache(base))` for a GitHub App.
#[derive(Clone)]
pub struct GitHubTransportBuilder {
    app_id: u64,
    api_url: Url,
    metrics: Option<Arc<Metrics>>,
}

impl GitHubTransportBuilder {
    pub fn new(app_id: u64, api_url: Url) -> Self {
        Self {
            app_id,
            api_url,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl TransportBuilder for GitHubTransportBuilder {
    fn build(
        &self,
        scope: Scope,
        key: &SigningKey,
        base: Arc<dyn Transport>,
    ) -> Result<Arc<dyn Transport>, CacheError> {
        let mut cache = CachingTransport::new(base);
        if let Some(metrics) = &self.metrics {
            cache = cache.with_hit_counter(metrics.http_cache_hits.clone());
        }
        let cache: Arc<dyn Transport> = Arc::new(cache);

        let transport: Arc<dyn Transport> = match scope {
            Scope::Application => Arc::new(AppTransport::new(cache, self.app_id, key)?),
            Scope::Installation(id) => Arc::new(InstallationTransport::new(
                cache,
                self.app_id,
                id,
                key,
                self.api_url.clone(),
            )?),
        };
        info!(%scope, app_id = self.app_id, "built authenticated transport");
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// App (JWT) transport
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Authenticates as the app itself.
pub struct AppTransport {
    inner: Arc<dyn Transport>,
    app_id: u64,
    key: EncodingKey,
}

impl AppTransport {
    pub fn new(inner: Arc<dyn Transport>, app_id: u64, key: &SigningKey) -> Result<Self, CacheError> {
        let construction_error = |source: Box<dyn std::error::Error + Send + Sync>| {
            CacheError::TransportConstruction {
                scope: Scope::Application.to_string(),
                source,
            }
        };
        if app_id == 0 {
            return Err(construction_error("app id must be non-zero".into()));
        }
        let key = EncodingKey::from_rsa_pem(key.expose()).map_err(|e| construction_error(e.into()))?;
        let transport = Self { inner, app_id, key };
        // Fail now rather than on first request if the key cannot sign.
        transport.jwt().map_err(|e| construction_error(e.into()))?;
        Ok(transport)
    }

    fn jwt(&self) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - JWT_BACKDATE_SECS,
            exp: now + JWT_LIFETIME_SECS,
            iss: self.app_id.to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
    }
}

#[async_trait]
impl Transport for AppTransport {
    async fn round_trip(&self, mut req: ApiRequest) -> Result<ApiResponse, CacheError> {
        let jwt = self.jwt().map_err(|e| CacheError::transport(req.url.as_str(), e))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {jwt}"))
            .map_err(|e| CacheError::transport(req.url.as_str(), e))?;
        req.headers.insert(AUTHORIZATION, bearer);
        req.headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static(GITHUB_ACCEPT));
        self.inner.round_trip(req).await
    }
}

// ---------------------------------------------------------------------------
// Installation transport
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_usable(&self) -> bool {
        self.expires_at - ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS) > Utc::now()
    }
}

/// Authenticates as one installation of the app.
pub struct InstallationTransport {
    inner: Arc<dyn Transport>,
    app: AppTransport,
    installation_id: InstallationId,
    tokens_url: Url,
    token: Mutex<Option<CachedToken>>,
}

impl InstallationTransport {
    pub fn new(
        inner: Arc<dyn Transport>,
        app_id: u64,
        installation_id: InstallationId,
        key: &SigningKey,
        api_url: Url,
    ) -> Result<Self, CacheError> {
        let scope = Scope::Installation(installation_id);
        if installation_id <= 0 {
            return Err(CacheError::TransportConstruction {
                scope: scope.to_string(),
                source: "installation id must be positive".into(),
            });
        }
        let tokens_url = endpoint(
            &api_url,
            &format!("app/installations/{installation_id}/access_tokens"),
        )
        .map_err(|e| CacheError::TransportConstruction {
            scope: scope.to_string(),
            source: e.into(),
        })?;
        let app = AppTransport::new(Arc::clone(&inner), app_id, key).map_err(|e| match e {
            CacheError::TransportConstruction { source, .. } => {
                CacheError::TransportConstruction {
                    scope: scope.to_string(),
                    source,
                }
            }
            other => other,
        })?;
        Ok(Self {
            inner,
            app,
            installation_id,
            tokens_url,
            token: Mutex::new(None),
        })
    }

    /// A usable installation token, minting a new one if needed.  Concurrent
    /// callers share one refresh.
    #[instrument(skip(self), fields(installation_id = self.installation_id))]
    async fn token(&self) -> Result<String, CacheError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_usable()) {
            return Ok(token.token.clone());
        }

        let url = self.tokens_url.to_string();
        let resp = self
            .app
            .round_trip(ApiRequest::post(self.tokens_url.clone()))
            .await
            .map_err(|e| CacheError::TokenExchangeFailed {
                url: url.clone(),
                detail: crate::error::display_chain(&e),
            })?;
        if !resp.status.is_success() {
            return Err(CacheError::TokenExchangeFailed {
                url,
                detail: format!("unexpected status {}", resp.status),
            });
        }
        let body: AccessTokenResponse =
            resp.json().map_err(|e| CacheError::TokenExchangeFailed {
                url: url.clone(),
                detail: format!("invalid access token response: {e}"),
            })?;

        debug!(expires_at = %body.expires_at, "minted installation access token");
        let token = body.token.clone();
        *cached = Some(CachedToken {
            token: body.token,
            expires_at: body.expires_at,
        });
        Ok(token)
    }
}

#[async_trait]
impl Transport for InstallationTransport {
    async fn round_trip(&self, mut req: ApiRequest) -> Result<ApiResponse, CacheError> {
        let token = self.token().await?;
        let value = HeaderValue::from_str(&format!("token {token}"))
            .map_err(|e| CacheError::transport(req.url.as_str(), e))?;
        req.headers.insert(AUTHORIZATION, value);
        req.headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static(GITHUB_ACCEPT));
        self.inner.round_trip(req).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
