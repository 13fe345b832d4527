//! Signing-key retrieval for the GitHub App.
//!
//! The key is either given directly in the configuration or read from a
//! secret-variable backend (file, environment, Linux kernel keyring, AWS
//! Secrets Manager) selected by the locator's scheme.

pub mod backends;
pub mod key_provider;
pub mod keyring;

pub use backends::{BackendRegistry, ResolvedVariable, VariableBackend, VariableHandle};
pub use key_provider::{KeyFetcher, KeyProvider, SigningKey, DIRECT_KEY_SECRET};
