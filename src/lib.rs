//! Shared-resource caches for a repository policy bot.
//!
//! Two process-wide caches, both constructed once and shared through `Arc`:
//!
//! * [`InstallationClients`] hands out one authenticated GitHub API client
//!   per app installation, built single-flight on first use.
//! * [`LocalRepoCache`] keeps one cloned working copy per repository so
//!   file-system-level checks do not clone again for every check.

pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod forge;
pub mod git;
pub mod local;
pub mod metrics;

pub use config::{load_config, Config};
pub use credentials::{BackendRegistry, KeyFetcher, KeyProvider, SigningKey};
pub use error::{CacheError, Result};
pub use forge::{installation_access_token, ApiClient, InstallationClients, InstallationId, Scope};
pub use local::{LocalRepoCache, LocalWorkingCopy};
pub use metrics::{Metrics, MetricsRegistry};
