//! Hosted-API client layer.
//!
//! Everything that talks to the GitHub REST API lives here: the transport
//! chain ([`transport`], [`http_cache`], [`app_auth`]), the [`ApiClient`]
//! built on top of it, the per-installation [`InstallationClients`] cache,
//! and the org-scoped [`installation_access_token`] helper.

pub mod app_auth;
pub mod client;
pub mod clients;
pub mod http_cache;
pub mod token;
pub mod transport;

use std::fmt;

pub use app_auth::{GitHubTransportBuilder, TransportBuilder};
pub use client::{ApiClient, Installation};
pub use clients::{ClientCache, InstallationClients};
pub use token::installation_access_token;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};

/// Numeric installation identifier.  `0` means "the app itself".
pub type InstallationId = i64;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// What a transport chain authenticates as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The GitHub App, authenticated with its own JWT.
    Application,
    /// One installation of the app, authenticated with an installation token.
    Installation(InstallationId),
}

impl Scope {
    pub fn for_installation(installation_id: InstallationId) -> Self {
        if installation_id == 0 {
            Scope::Application
        } else {
            Scope::Installation(installation_id)
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Application => f.write_str("application"),
            Scope::Installation(id) => write!(f, "installation {id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_application_scope() {
        assert_eq!(Scope::for_installation(0), Scope::Application);
        assert_eq!(Scope::for_installation(42), Scope::Installation(42));
        assert_eq!(Scope::for_installation(42).to_string(), "installation 42");
        assert_eq!(Scope::Application.to_string(), "application");
    }
}
