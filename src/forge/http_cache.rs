//! Private HTTP response cache layer.
//!
//! Successful `GET` responses that carry a validator (`ETag` /
//! `Last-Modified`) or a `max-age` are kept in a process-local
//! [`MemoryStore`].  A fresh entry is served without touching the network; a
//! stale one is revalidated with a conditional request and served again on
//! `304 Not Modified`.  Anything served from the store carries
//! `X-From-Cache: 1`.
//!
//! Entries remember the request headers named by the response's `Vary`; a
//! later request whose values differ goes to the network.  `Vary: *` is never
//! stored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use prometheus_client::metrics::counter::Counter;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, VARY,
};
use reqwest::{Method, StatusCode};
use tracing::{debug, trace};

use crate::error::CacheError;

use super::transport::{ApiRequest, ApiResponse, Transport, X_FROM_CACHE};

/// Responses kept per transport chain before the least recently used go.
const DEFAULT_CAPACITY: u64 = 10_000;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedResponse {
    response: ApiResponse,
    stored_at: Instant,
    max_age: Option<Duration>,
    /// Request header values for each name in the response's `Vary`.
    vary: Vec<(HeaderName, Option<HeaderValue>)>,
}

impl CachedResponse {
    fn is_fresh(&self) -> bool {
        self.max_age
            .is_some_and(|max_age| self.stored_at.elapsed() < max_age)
    }

    fn matches(&self, request: &HeaderMap) -> bool {
        self.vary
            .iter()
            .all(|(name, value)| request.get(name) == value.as_ref())
    }
}

/// In-memory response store, one per transport chain.
pub struct MemoryStore {
    entries: Cache<String, CachedResponse>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .name("http_responses")
                .build(),
        }
    }

    async fn get(&self, key: &str) -> Option<CachedResponse> {
        self.entries.get(key).await
    }

    async fn put(&self, key: String, entry: CachedResponse) {
        self.entries.insert(key, entry).await;
    }

    async fn delete(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ---------------------------------------------------------------------------
// Cache-Control
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
struct CacheControl {
    no_store: bool,
    no_cache: bool,
    max_age: Option<Duration>,
}

fn cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();
    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            match directive.split_once('=') {
                Some(("max-age", secs)) => {
                    cc.max_age = secs.trim_matches('"').parse().ok().map(Duration::from_secs);
                }
                None if directive == "no-store" => cc.no_store = true,
                None if directive == "no-cache" => cc.no_cache = true,
                _ => {}
            }
        }
    }
    cc
}

fn has_validator(headers: &HeaderMap) -> bool {
    headers.contains_key(ETAG) || headers.contains_key(LAST_MODIFIED)
}

/// Header names listed in `Vary`, or `None` for `Vary: *`.
fn vary_names(headers: &HeaderMap) -> Option<Vec<HeaderName>> {
    let mut names = Vec::new();
    for value in headers.get_all(VARY) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name == "*" {
                return None;
            }
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                names.push(name);
            }
        }
    }
    Some(names)
}

fn mark_cached(mut response: ApiResponse) -> ApiResponse {
    response
        .headers
        .insert(X_FROM_CACHE, HeaderValue::from_static("1"));
    response
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Response-caching layer over an inner [`Transport`].
pub struct CachingTransport {
    inner: Arc<dyn Transport>,
    store: MemoryStore,
    hits: Option<Counter>,
}

impl CachingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            store: MemoryStore::new(),
            hits: None,
        }
    }

    /// Count every response served from the store on `hits`.
    pub fn with_hit_counter(mut self, hits: Counter) -> Self {
        self.hits = Some(hits);
        self
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn served_from_cache(&self, response: ApiResponse) -> ApiResponse {
        if let Some(hits) = &self.hits {
            hits.inc();
        }
        mark_cached(response)
    }
}

#[async_trait]
impl Transport for CachingTransport {
    async fn round_trip(&self, mut req: ApiRequest) -> Result<ApiResponse, CacheError> {
        let key = req.url.to_string();

        if req.method != Method::GET {
            // Unsafe methods may change the resource; drop what we know of it.
            if req.method != Method::HEAD {
                self.store.delete(&key).await;
            }
            return self.inner.round_trip(req).await;
        }

        let req_cc = cache_control(&req.headers);
        let cached = if req_cc.no_store {
            None
        } else {
            self.store
                .get(&key)
                .await
                .filter(|entry| entry.matches(&req.headers))
        };
        let request_headers = req.headers.clone();

        if let Some(entry) = &cached {
            if entry.is_fresh() && !req_cc.no_cache {
                trace!(url = %key, "serving fresh response from HTTP cache");
                return Ok(self.served_from_cache(entry.response.clone()));
            }
            if let Some(etag) = entry.response.headers.get(ETAG) {
                req.headers.insert(IF_NONE_MATCH, etag.clone());
            }
            if let Some(modified) = entry.response.headers.get(LAST_MODIFIED) {
                req.headers.insert(IF_MODIFIED_SINCE, modified.clone());
            }
        }

        let response = self.inner.round_trip(req).await?;

        if response.status == StatusCode::NOT_MODIFIED {
            if let Some(mut entry) = cached {
                debug!(url = %key, "revalidated cached response");
                let resp_cc = cache_control(&response.headers);
                entry.stored_at = Instant::now();
                if resp_cc.max_age.is_some() {
                    entry.max_age = resp_cc.max_age;
                }
                let served = entry.response.clone();
                self.store.put(key, entry).await;
                return Ok(self.served_from_cache(served));
            }
            return Ok(response);
        }

        let resp_cc = cache_control(&response.headers);
        let vary = vary_names(&response.headers);
        let storable = response.status == StatusCode::OK
            && !req_cc.no_store
            && !resp_cc.no_store
            && (has_validator(&response.headers) || resp_cc.max_age.is_some());

        match vary {
            Some(names) if storable => {
                let vary = names
                    .into_iter()
                    .map(|name| {
                        let value = request_headers.get(&name).cloned();
                        (name, value)
                    })
                    .collect();
                self.store
                    .put(
                        key,
                        CachedResponse {
                            response: response.clone(),
                            stored_at: Instant::now(),
                            max_age: resp_cc.max_age,
                            vary,
                        },
                    )
                    .await;
            }
            // `Vary: *` or an uncacheable error replaces nothing usable.
            None if storable => self.store.delete(&key).await,
            _ if !response.status.is_success() => self.store.delete(&key).await,
            _ => {}
        }

        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
