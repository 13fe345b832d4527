use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScopeLabels {
    pub scope: ScopeKind,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ScopeKind {
    Application,
    Installation,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    pub step: CloneStep,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CloneStep {
    Clone,
    Fetch,
    Worktree,
    Adapter,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the caches.
pub struct Metrics {
    // -- installation clients --
    pub client_cache_hits: Counter,
    pub client_cache_misses: Counter,
    pub transport_constructions: Family<ScopeLabels, Counter>,
    pub clients_cached: Gauge,

    // -- http cache --
    pub http_cache_hits: Counter,

    // -- working copies --
    pub clone_total: Counter,
    pub clone_failures: Family<StepLabels, Counter>,
    pub clone_duration_seconds: Histogram,
    pub working_copies: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let client_cache_hits = Counter::default();
        registry.register(
            "policybot_client_cache_hits",
            "Installation client cache hits",
            client_cache_hits.clone(),
        );

        let client_cache_misses = Counter::default();
        registry.register(
            "policybot_client_cache_misses",
            "Installation client cache misses",
            client_cache_misses.clone(),
        );

        let transport_constructions = Family::<ScopeLabels, Counter>::default();
        registry.register(
            "policybot_transport_constructions",
            "Authenticated transports built, by signing scope",
            transport_constructions.clone(),
        );

        let clients_cached: Gauge = Gauge::default();
        registry.register(
            "policybot_clients_cached",
            "Installation clients currently cached",
            clients_cached.clone(),
        );

        let http_cache_hits = Counter::default();
        registry.register(
            "policybot_http_cache_hits",
            "API responses served from the in-memory HTTP cache",
            http_cache_hits.clone(),
        );

        let clone_total = Counter::default();
        registry.register(
            "policybot_clone",
            "Working-copy clones started",
            clone_total.clone(),
        );

        let clone_failures = Family::<StepLabels, Counter>::default();
        registry.register(
            "policybot_clone_failures",
            "Working-copy constructions that failed, by step",
            clone_failures.clone(),
        );

        let clone_duration_seconds = Histogram::new(exponential_buckets(0.1, 2.0, 12));
        registry.register(
            "policybot_clone_duration_seconds",
            "Time to clone, fetch and initialise a working copy",
            clone_duration_seconds.clone(),
        );

        let working_copies: Gauge = Gauge::default();
        registry.register(
            "policybot_working_copies",
            "Working copies currently cached on disk",
            working_copies.clone(),
        );

        Self {
            client_cache_hits,
            client_cache_misses,
            transport_constructions,
            clients_cached,
            http_cache_hits,
            clone_total,
            clone_failures,
            clone_duration_seconds,
            working_copies,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Registry plus the metrics registered in it, shared by both caches.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry)?;
        Ok(out)
    }
}
