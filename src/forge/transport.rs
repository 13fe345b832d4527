//! Request/response transport abstraction for the hosted API.
//!
//! Each layer of an installation's transport chain (authentication, response
//! caching, the HTTP base) implements [`Transport`] and wraps the next one.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use crate::error::CacheError;

/// Header set on responses served from the in-memory HTTP cache.
pub const X_FROM_CACHE: &str = "x-from-cache";

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json_body(mut self, body: &serde_json::Value) -> Self {
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(body.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    /// Whether this response was served by the HTTP cache layer rather than
    /// the network.
    pub fn is_from_cache(&self) -> bool {
        self.headers.contains_key(X_FROM_CACHE)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: ApiRequest) -> Result<ApiResponse, CacheError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, req: ApiRequest) -> Result<ApiResponse, CacheError> {
        (**self).round_trip(req).await
    }
}

// ---------------------------------------------------------------------------
// reqwest base transport
// ---------------------------------------------------------------------------

/// The network end of every chain.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| CacheError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, req), fields(method = %req.method, url = %req.url))]
    async fn round_trip(&self, req: ApiRequest) -> Result<ApiResponse, CacheError> {
        let url = req.url.to_string();
        let mut builder = self.client.request(req.method, req.url).headers(req.headers);
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| CacheError::transport(&url, e))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| CacheError::transport(&url, e))?;

        debug!(%status, bytes = body.len(), "upstream API response");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

/// Join `path` onto the API root, keeping any path prefix the root has
/// (e.g. `/api/v3` on GitHub Enterprise).
pub fn endpoint(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_enterprise_prefix() {
        let base = Url::parse("https://ghe.example.com/api/v3").unwrap();
        assert_eq!(
            endpoint(&base, "/orgs/acme/installation").unwrap().as_str(),
            "https://ghe.example.com/api/v3/orgs/acme/installation"
        );
    }

    #[test]
    fn endpoint_on_bare_host() {
        let base = Url::parse("https://api.github.com").unwrap();
        assert_eq!(
            endpoint(&base, "app/installations/42/access_tokens")
                .unwrap()
                .as_str(),
            "https://api.github.com/app/installations/42/access_tokens"
        );
    }

    #[tokio::test]
    async fn http_transport_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/echo")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::JsonString(r#"{"a":1}"#.into()))
            .with_status(201)
            .with_header("etag", "\"v1\"")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new("policybot-test").unwrap();
        let url = Url::parse(&format!("{}/echo", server.url())).unwrap();
        let resp = transport
            .round_trip(ApiRequest::post(url).json_body(&serde_json::json!({"a": 1})))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(resp.status, StatusCode::CREATED);
        assert!(!resp.is_from_cache());
        let body: serde_json::Value = resp.json().unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn http_transport_connection_error_is_transport_error() {
        let transport = HttpTransport::new("policybot-test").unwrap();
        // Port 9 (discard) on localhost is essentially never listening.
        let url = Url::parse("http://127.0.0.1:9/nothing").unwrap();
        let err = transport.round_trip(ApiRequest::get(url)).await.unwrap_err();
        assert!(matches!(err, CacheError::Transport { .. }));
    }
}
