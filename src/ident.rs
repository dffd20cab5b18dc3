//! Handshake payloads: the identity the agent presents and the grant the
//! broker issues back.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// The fingerprint payload sent during the handshake.
///
/// Static host facts are gathered once at `open` (working directory,
/// executable, hostname, user); the per-attempt fields (`machine_id`,
/// `inet`, `mac`, `time_at`) are stamped by the supervisor just before each
/// handshake. Immutable once the handshake request is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Agent version.
    pub semver: String,
    /// Stable node fingerprint (see the machine-id module).
    pub machine_id: String,
    /// Egress IP of the socket used for this handshake.
    pub inet: IpAddr,
    /// MAC of the interface owning `inet`; empty when unresolvable.
    pub mac: String,
    pub os: String,
    pub arch: String,
    pub cpu: usize,
    pub pid: u32,
    pub workdir: String,
    pub executable: String,
    pub username: String,
    pub hostname: String,
    /// Heartbeat interval in seconds; 0 when the monitor is disabled. The
    /// broker treats three missed intervals as a dead session.
    pub interval: u64,
    /// Agent wall-clock at handshake time.
    pub time_at: DateTime<Utc>,
    pub silent: bool,
    pub unstable: bool,
    pub customized: String,
}

impl Identity {
    /// Gather the process-wide facts once. Per-attempt fields are left
    /// blank for [`Identity::stamp`].
    pub(crate) fn collect(cfg: &Config, heartbeat: Duration) -> Identity {
        Identity {
            semver: cfg.semver.clone(),
            machine_id: String::new(),
            inet: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mac: String::new(),
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            cpu: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            pid: std::process::id(),
            workdir: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            executable: std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            username: whoami::username(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            interval: heartbeat.as_secs(),
            time_at: Utc::now(),
            silent: cfg.silent,
            unstable: cfg.unstable,
            customized: cfg.customized.clone(),
        }
    }

    /// Fill the per-attempt fields for one handshake.
    pub(crate) fn stamp(&self, machine_id: &str, inet: IpAddr, mac: String) -> Identity {
        let mut ident = self.clone();
        ident.machine_id = machine_id.to_owned();
        ident.inet = inet;
        ident.mac = mac;
        ident.time_at = Utc::now();
        ident
    }
}

/// Broker response to a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionGrant {
    /// Numeric node id assigned by the broker.
    pub id: i64,
    /// Symmetric key material for the session's frame crypto.
    #[serde(with = "b64")]
    pub passwd: Vec<u8>,
}

/// Serde adapter: byte vectors ride JSON as standard base64.
mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
