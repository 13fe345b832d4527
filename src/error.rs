//! Error taxonomy shared by both caches.
//!
//! Every variant names the key or locator it concerns and keeps the
//! underlying cause as its `source`, so callers can log the full chain with
//! `{:#}` through `anyhow` or match on the variant.

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("signing key unavailable from {source_name}")]
    KeyUnavailable {
        source_name: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to construct transport for {scope}")]
    TransportConstruction {
        scope: String,
        #[source]
        source: BoxError,
    },

    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("no app installation found for org {org}: {detail}")]
    InstallationNotFound { org: String, detail: String },

    #[error("installation record for org {org} is malformed (access token URL {url:?}): {detail}")]
    MalformedInstallation {
        org: String,
        url: String,
        detail: String,
    },

    #[error("token exchange at {url} failed: {detail}")]
    TokenExchangeFailed { url: String, detail: String },

    #[error("clone of {locator} failed")]
    CloneFailed {
        locator: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("fetching all refs for {locator} failed")]
    FetchFailed {
        locator: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("worktree for {locator} unavailable")]
    WorktreeError {
        locator: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("repo client initialisation for {locator} failed")]
    AdapterInitError {
        locator: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("branch {branch} not found in {locator}")]
    RefNotFound { locator: String, branch: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    pub(crate) fn key_unavailable(
        source_name: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::KeyUnavailable {
            source_name: source_name.into(),
            source: source.into(),
        }
    }

    pub(crate) fn transport(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            url: url.into(),
            source: source.into(),
        }
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Render an error and all of its sources as `outer: inner: root`.
pub(crate) fn display_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
