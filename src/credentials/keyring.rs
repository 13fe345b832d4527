//! Linux kernel keyring reads for `keyring://` secret locators.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use linux_keyutils::{KeyRing, KeyRingIdentifier};
use tokio::process::Command;
use tracing::{debug, warn};

/// Which keyring a `keyring://` locator searches, chosen with `?ring=`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ring {
    #[default]
    Session,
    User,
    Process,
}

impl Ring {
    fn identifier(self) -> KeyRingIdentifier {
        match self {
            Ring::Session => KeyRingIdentifier::Session,
            Ring::User => KeyRingIdentifier::User,
            Ring::Process => KeyRingIdentifier::Process,
        }
    }

    /// `keyctl` shorthand for the ring.
    fn keyctl_id(self) -> &'static str {
        match self {
            Ring::Session => "@s",
            Ring::User => "@u",
            Ring::Process => "@p",
        }
    }
}

impl FromStr for Ring {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "session" => Ok(Ring::Session),
            "user" => Ok(Ring::User),
            "process" => Ok(Ring::Process),
            other => bail!("unknown keyring '{other}' (expected session, user or process)"),
        }
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Ring::Session => "session",
            Ring::User => "user",
            Ring::Process => "process",
        })
    }
}

/// Read the payload of `user` key `description` from `ring`.
///
/// Uses the keyutils syscalls directly and falls back to the `keyctl` CLI
/// when those fail (e.g. under seccomp profiles that block `keyctl(2)`).
pub async fn read_key(ring: Ring, description: &str) -> Result<Vec<u8>> {
    match read_key_native(ring, description) {
        Ok(payload) => {
            debug!(%ring, description, "read key via keyutils");
            Ok(payload)
        }
        Err(e) => {
            warn!(
                %ring,
                description,
                error = %e,
                "keyutils read failed, falling back to keyctl CLI"
            );
            read_key_cli(ring, description).await
        }
    }
}

pub(crate) fn read_key_native(ring: Ring, description: &str) -> Result<Vec<u8>> {
    let keyring = KeyRing::from_special_id(ring.identifier(), false)
        .map_err(|e| anyhow::anyhow!("failed to open {ring} keyring: {e:?}"))?;
    let key = keyring
        .search(description)
        .map_err(|e| anyhow::anyhow!("key '{description}' not found in {ring} keyring: {e:?}"))?;
    key.read_to_vec()
        .map_err(|e| anyhow::anyhow!("failed to read payload of '{description}': {e:?}"))
}

async fn keyctl(args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("keyctl")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to spawn keyctl {}", args[0]))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("keyctl {} failed (status {}): {}", args[0], output.status, stderr.trim());
    }
    Ok(output.stdout)
}

async fn read_key_cli(ring: Ring, description: &str) -> Result<Vec<u8>> {
    let id = keyctl(&["search", ring.keyctl_id(), "user", description]).await?;
    let id = String::from_utf8_lossy(&id).trim().to_string();
    if id.is_empty() {
        bail!("keyctl search returned no key id for '{description}'");
    }
    // `pipe` writes the raw payload, no trailing newline.
    keyctl(&["pipe", &id]).await
}
