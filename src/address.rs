//! Broker endpoint addresses.
//!
//! Raw config strings are normalized into [`Address`] values:
//! - `tls://host[:port]` / `tcp://host[:port]` pick the transport explicitly
//!   (`https`/`wss` and `http`/`ws` are accepted aliases);
//! - `host:port` without a scheme is TLS iff the port is 443;
//! - a bare `host` expands into both a `tls://host:443` and a
//!   `tcp://host:80` candidate;
//! - an optional `name@` userinfo sets the SNI / Host name, which otherwise
//!   defaults to the host portion (or the book-wide server name).
//!
//! [`AddressBook`] keeps the deduplicated, first-seen-ordered list and a
//! rotating cursor: each `next()` hands out the current endpoint and then
//! advances, so consecutive dials rotate deterministically.

use std::fmt;
use std::net::IpAddr;

use crate::error::TunnelError;

/// Where an endpoint lives relative to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Loopback or RFC-1918 literal: reachable without leaving the site.
    Lan,
    Public,
}

/// One broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    /// SNI for TLS endpoints and the `Host` header of the handshake
    /// request. Never empty: defaults to `host`.
    pub name: String,
    pub origin: Origin,
}

impl Address {
    /// `host:port`, bracketing IPv6 hosts.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Normalize one raw string. A scheme-less, port-less host yields two
    /// candidates (TLS:443 then plain:80); everything else yields one.
    pub fn parse(raw: &str, server_name: Option<&str>) -> Result<Vec<Address>, TunnelError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TunnelError::InvalidAddress(raw.to_owned()));
        }

        let (scheme, rest) = match raw.split_once("://") {
            Some((s, r)) => (Some(s), r),
            None => (None, raw),
        };
        let (userinfo, rest) = match rest.split_once('@') {
            Some((u, r)) => (Some(u), r),
            None => (None, rest),
        };
        // Drop any path or query; only the authority matters.
        let authority = rest
            .split(['/', '?'])
            .next()
            .unwrap_or_default();
        let (host, port) = split_host_port(authority)
            .ok_or_else(|| TunnelError::InvalidAddress(raw.to_owned()))?;
        if host.is_empty() {
            return Err(TunnelError::InvalidAddress(raw.to_owned()));
        }

        let name = userinfo
            .filter(|u| !u.is_empty())
            .or(server_name)
            .unwrap_or(&host)
            .to_owned();
        let origin = classify(&host);
        let make = |tls: bool, port: u16| Address {
            tls,
            host: host.clone(),
            port,
            name: name.clone(),
            origin,
        };

        let variants = match scheme {
            Some("tls" | "https" | "wss") => vec![make(true, port.unwrap_or(443))],
            Some("tcp" | "http" | "ws") => vec![make(false, port.unwrap_or(80))],
            Some(_) => return Err(TunnelError::InvalidAddress(raw.to_owned())),
            None => match port {
                Some(p) => vec![make(p == 443, p)],
                None => vec![make(true, 443), make(false, 80)],
            },
        };
        Ok(variants)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", if self.tls { "tls" } else { "tcp" })?;
        if self.name != self.host {
            write!(f, "{}@", self.name)?;
        }
        write!(f, "{}", self.authority())
    }
}

/// Split `host[:port]`, handling bracketed IPv6 literals. Returns `None`
/// for syntactically broken input (empty port, non-numeric port on a
/// non-IPv6 host).
fn split_host_port(authority: &str) -> Option<(String, Option<u16>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail {
            "" => Some((host.to_owned(), None)),
            _ => {
                let port = tail.strip_prefix(':')?.parse().ok()?;
                Some((host.to_owned(), Some(port)))
            }
        };
    }
    match authority.rsplit_once(':') {
        None => Some((authority.to_owned(), None)),
        Some((host, port)) => {
            if let Ok(p) = port.parse::<u16>() {
                Some((host.to_owned(), Some(p)))
            } else if host.contains(':') {
                // Unbracketed IPv6 literal, no port.
                Some((authority.to_owned(), None))
            } else {
                None
            }
        }
    }
}

fn classify(host: &str) -> Origin {
    if host.eq_ignore_ascii_case("localhost") {
        return Origin::Lan;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => Origin::Lan,
        Ok(IpAddr::V4(v4)) if v4.is_private() => Origin::Lan,
        _ => Origin::Public,
    }
}

/// Ordered endpoint list with a rotating cursor.
#[derive(Debug, Clone)]
pub struct AddressBook {
    addrs: Vec<Address>,
    cursor: usize,
}

impl AddressBook {
    /// Normalize and deduplicate a raw address list. Blank entries are
    /// skipped; an effectively empty list is an error, a malformed entry
    /// is too.
    pub fn parse(raws: &[String], server_name: Option<&str>) -> Result<Self, TunnelError> {
        let mut addrs: Vec<Address> = Vec::with_capacity(raws.len());
        for raw in raws {
            if raw.trim().is_empty() {
                continue;
            }
            for addr in Address::parse(raw, server_name)? {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        if addrs.is_empty() {
            return Err(TunnelError::EmptyAddresses);
        }
        Ok(AddressBook { addrs, cursor: 0 })
    }

    /// Canonical string forms of a raw list. Idempotent: feeding the output
    /// back in reproduces it.
    pub fn preformat(raws: &[String], server_name: Option<&str>) -> Result<Vec<String>, TunnelError> {
        let book = Self::parse(raws, server_name)?;
        Ok(book.addrs.iter().map(ToString::to_string).collect())
    }

    /// The endpoint the next `next()` call will hand out.
    pub fn peek(&self) -> &Address {
        &self.addrs[self.cursor]
    }

    /// Return the current endpoint and advance the cursor (mod length).
    pub fn next(&mut self) -> Address {
        let addr = self.addrs[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.addrs.len();
        addr
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addrs
    }
}
