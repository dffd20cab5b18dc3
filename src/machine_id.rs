//! Stable node fingerprint.
//!
//! The broker keys agents on this value, so it must survive reboots, DHCP
//! churn, and hostname edits (hence the disk cache) while still diverging
//! between cloned VM images (hence hostname + MAC/IP material on top of the
//! OS machine id). When the broker reports a duplicate registration the
//! supervisor asks for one rebuild, which recomputes from the live host and
//! overwrites the cache.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

/// Default cache file, relative to the working directory.
pub const DEFAULT_CACHE_FILE: &str = ".ssoc-machine-id";

/// Agent identity seam. `rebuild = true` forces recomputation even when a
/// cached value exists; the supervisor invokes that at most once per
/// lifetime.
pub trait Identifier: Send + Sync + 'static {
    fn machine_id(&self, rebuild: bool) -> String;
}

/// Default implementation: hex SHA-1 over OS machine id, hostname, and the
/// qualifying-interface table, cached on disk.
pub struct MachineId {
    path: PathBuf,
}

impl MachineId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MachineId { path: path.into() }
    }
}

impl Default for MachineId {
    fn default() -> Self {
        MachineId::new(DEFAULT_CACHE_FILE)
    }
}

impl Identifier for MachineId {
    fn machine_id(&self, rebuild: bool) -> String {
        if !rebuild {
            if let Some(cached) = read_cache(&self.path) {
                debug!(path = %self.path.display(), "machine id loaded from cache");
                return cached;
            }
        }

        let host_id = host_id().unwrap_or_default();
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entries = network_entries();
        let mid = fingerprint(&host_id, &host, &entries);

        if let Err(e) = write_cache(&self.path, &mid) {
            warn!(path = %self.path.display(), error = %e, "machine id cache write failed");
        }
        debug!(machine_id = %mid, interfaces = entries.len(), "machine id computed");
        mid
    }
}

fn read_cache(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_owned())
    }
}

fn write_cache(path: &Path, mid: &str) -> std::io::Result<()> {
    fs::write(path, mid)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Pure fingerprint over the three inputs, `|`-separated, interface
/// entries sorted and comma-joined.
pub(crate) fn fingerprint(host_id: &str, hostname: &str, entries: &[String]) -> String {
    let mut sorted = entries.to_vec();
    sorted.sort();
    let networks = sorted.join(",");
    let input = [host_id, hostname, &networks].join("|");
    hex::encode(Sha1::digest(input.as_bytes()))
}

/// Interface facts relevant to qualification, detached from the
/// enumeration backend so the rules stay testable.
#[derive(Debug, Clone)]
struct IfaceFacts {
    name: String,
    /// Windows adapter description; empty elsewhere.
    description: String,
    mac: [u8; 6],
    up: bool,
    loopback: bool,
    point_to_point: bool,
    ips: Vec<IpAddr>,
}

/// Adapter names that identify virtual NICs whose MACs are unstable or
/// shared across clones. Hyper-V adapters stay in deliberately: on Hyper-V
/// hosts the vEthernet adapter is often the only uplink.
const VIRTUAL_ADAPTERS: &[&str] = &[
    "vmware",
    "vmnet",
    "virtualbox",
    "vboxnet",
    "tap-windows",
    "tap",
    "tun",
    "openvpn",
    "wireguard",
];

fn is_virtual_adapter(name: &str, description: &str) -> bool {
    let name = name.to_ascii_lowercase();
    let description = description.to_ascii_lowercase();
    VIRTUAL_ADAPTERS.iter().any(|v| {
        name == *v
            || name.starts_with(*v)
            || (!description.is_empty() && description.starts_with(*v))
    })
}

fn qualifies(face: &IfaceFacts) -> bool {
    if !face.up || face.loopback || face.point_to_point {
        return false;
    }
    if face.mac == [0u8; 6] {
        return false;
    }
    // Locally administered MACs are software-assigned (bridges, bonds,
    // container veths) and change between hosts that are otherwise clones.
    if face.mac[0] & 0x02 != 0 {
        return false;
    }
    if is_virtual_adapter(&face.name, &face.description) {
        return false;
    }
    face.ips.iter().any(|ip| ip.is_ipv4() && usable_ip(ip))
}

fn usable_ip(ip: &IpAddr) -> bool {
    if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() {
        return false;
    }
    match ip {
        IpAddr::V4(_) => true,
        // Link-local v6 churns with the interface; exclude it.
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

fn mac_string(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// One entry per qualifying interface: `MAC,ip1,ip2,…`.
fn entry(face: &IfaceFacts) -> String {
    let mut parts = vec![mac_string(&face.mac)];
    parts.extend(
        face.ips
            .iter()
            .filter(|ip| usable_ip(ip))
            .map(ToString::to_string),
    );
    parts.join(",")
}

fn network_entries() -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();
    for face in enumerate() {
        if !qualifies(&face) {
            debug!(iface = %face.name, "interface skipped for fingerprint");
            continue;
        }
        if seen.insert(face.mac) {
            entries.push(entry(&face));
        }
    }
    entries
}

fn enumerate() -> Vec<IfaceFacts> {
    pnet_datalink::interfaces()
        .into_iter()
        .map(|iface| IfaceFacts {
            up: iface.is_up(),
            loopback: iface.is_loopback(),
            point_to_point: iface.is_point_to_point(),
            mac: iface.mac.map(|m| m.octets()).unwrap_or_default(),
            ips: iface.ips.iter().map(|net| net.ip()).collect(),
            description: iface.description.clone(),
            name: iface.name,
        })
        .collect()
}

/// OS-native machine id.
#[cfg(target_os = "linux")]
fn host_id() -> Option<String> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(text) = fs::read_to_string(path) {
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_owned());
            }
        }
    }
    None
}

#[cfg(target_os = "macos")]
fn host_id() -> Option<String> {
    let out = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&out.stdout);
    let line = text.lines().find(|l| l.contains("IOPlatformUUID"))?;
    let uuid = line.split('"').nth(3)?;
    Some(uuid.to_owned())
}

#[cfg(windows)]
fn host_id() -> Option<String> {
    use winreg::RegKey;
    use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ, KEY_WOW64_64KEY};

    let key = RegKey::predef(HKEY_LOCAL_MACHINE)
        .open_subkey_with_flags(r"SOFTWARE\Microsoft\Cryptography", KEY_READ | KEY_WOW64_64KEY)
        .ok()?;
    key.get_value::<String, _>("MachineGuid").ok()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn host_id() -> Option<String> {
    None
}
