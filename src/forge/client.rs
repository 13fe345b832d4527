use std::sync::Arc;

use serde::Deserialize;
use tracing::instrument;
use url::Url;

use crate::error::CacheError;

use super::transport::{endpoint, ApiRequest, ApiResponse, Transport};
use super::{InstallationId, Scope};

/// Installation record as returned by `GET /orgs/{org}/installation`.
#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    pub id: InstallationId,
    #[serde(default)]
    pub access_tokens_url: Option<String>,
    #[serde(default)]
    pub account: Option<Account>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub login: String,
}

/// REST client over an authenticated transport chain.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    base_url: Url,
    scope: Scope,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, base_url: Url, scope: Scope) -> Self {
        Self {
            transport,
            base_url,
            scope,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URL for an API path such as `orgs/acme/installation`.
    pub fn endpoint(&self, path: &str) -> Result<Url, CacheError> {
        endpoint(&self.base_url, path)
            .map_err(|e| CacheError::transport(format!("{}{path}", self.base_url), e))
    }

    /// Absolute URL with each of `segments` appended as one percent-encoded
    /// path segment, so a `/` or `?` inside a segment stays inside it.
    pub fn endpoint_segments(&self, segments: &[&str]) -> Result<Url, CacheError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                CacheError::transport(self.base_url.as_str(), "API base URL cannot hold a path")
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request through the client's transport chain as-is.
    pub async fn send(&self, req: ApiRequest) -> Result<ApiResponse, CacheError> {
        self.transport.round_trip(req).await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, CacheError> {
        let url = self.endpoint(path)?;
        self.send(ApiRequest::get(url)).await
    }

    /// Look up the app's installation on `org`.  The raw response is returned
    /// so callers can inspect the status.
    #[instrument(skip(self))]
    pub async fn find_org_installation(&self, org: &str) -> Result<ApiResponse, CacheError> {
        let url = self.endpoint_segments(&["orgs", org, "installation"])?;
        self.send(ApiRequest::get(url)).await
    }
}
