//! Endpoint dialing.
//!
//! The dialer walks the [`AddressBook`] cursor, connecting with plain TCP
//! or TLS (SNI = the endpoint's name, webpki trust roots) under a bounded
//! timeout, and resolves the MAC address owning a given local IP for the
//! handshake identity.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address::{Address, AddressBook};
use crate::error::TunnelError;

/// A connected broker socket, before the multiplexer takes over.
#[derive(Debug)]
pub(crate) enum BrokerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl BrokerStream {
    pub(crate) fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            BrokerStream::Plain(s) => s.local_addr(),
            BrokerStream::Tls(s) => s.get_ref().0.local_addr(),
        }
    }

    pub(crate) fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            BrokerStream::Plain(s) => s.peer_addr(),
            BrokerStream::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for BrokerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BrokerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

pub(crate) struct Dialer {
    book: AddressBook,
    tls: TlsConnector,
    /// MAC lookups keyed by local IP string; only the dial task touches it.
    macs: HashMap<String, String>,
}

impl Dialer {
    pub(crate) fn new(book: AddressBook) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Dialer {
            book,
            tls: TlsConnector::from(Arc::new(config)),
            macs: HashMap::new(),
        }
    }

    /// Dial the endpoint under the cursor and advance it. The caller gets
    /// the endpoint chosen *before* the advance.
    pub(crate) async fn dial_next(
        &mut self,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<(BrokerStream, Address), TunnelError> {
        let addr = self.book.next();
        let stream = tokio::select! {
            () = token.cancelled() => return Err(TunnelError::Cancelled),
            r = self.connect(&addr, timeout) => r,
        };
        match stream {
            Ok(s) => Ok((s, addr)),
            Err(e) => {
                debug!(addr = %addr, error = %e, "dial failed");
                Err(e)
            }
        }
    }

    async fn connect(&self, addr: &Address, timeout: Duration) -> Result<BrokerStream, TunnelError> {
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr.authority()))
            .await
            .map_err(|_| TunnelError::Timeout)??;
        tcp.set_nodelay(true)?;
        if !addr.tls {
            return Ok(BrokerStream::Plain(tcp));
        }

        let name = rustls_pki_types::ServerName::try_from(addr.name.clone())
            .map_err(|_| TunnelError::InvalidAddress(addr.name.clone()))?;
        let tls = tokio::time::timeout(timeout, self.tls.connect(name, tcp))
            .await
            .map_err(|_| TunnelError::Timeout)??;
        Ok(BrokerStream::Tls(Box::new(tls)))
    }

    /// MAC of the interface whose address set contains `ip`; empty string
    /// when no interface matches. Cached per IP.
    pub(crate) fn lookup_mac(&mut self, ip: IpAddr) -> String {
        let key = ip.to_string();
        if let Some(mac) = self.macs.get(&key) {
            return mac.clone();
        }
        let mac = pnet_datalink::interfaces()
            .into_iter()
            .find(|iface| iface.ips.iter().any(|net| net.ip() == ip))
            .and_then(|iface| iface.mac)
            .map(|m| m.to_string())
            .unwrap_or_default();
        self.macs.insert(key, mac.clone());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(raws: &[&str]) -> AddressBook {
        let raws: Vec<String> = raws.iter().map(|s| (*s).to_owned()).collect();
        AddressBook::parse(&raws, None).unwrap()
    }

    #[tokio::test]
    async fn dial_connects_to_a_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut dialer = Dialer::new(book(&[&format!("tcp://127.0.0.1:{port}")]));

        let token = CancellationToken::new();
        let (stream, addr) = dialer
            .dial_next(&token, Duration::from_secs(3))
            .await
            .unwrap();
        assert!(!addr.tls);
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn dial_surfaces_connection_refused() {
        // Bind then drop to find a port with nothing listening.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut dialer = Dialer::new(book(&[&format!("tcp://127.0.0.1:{port}")]));
        let token = CancellationToken::new();
        let err = dialer
            .dial_next(&token, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Io(_) | TunnelError::Timeout));
    }

    #[tokio::test]
    async fn cancellation_preempts_the_dial() {
        let mut dialer = Dialer::new(book(&["tcp://192.0.2.1:81"]));
        let token = CancellationToken::new();
        token.cancel();
        let err = dialer
            .dial_next(&token, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Cancelled));
    }

    #[tokio::test]
    async fn dial_rotates_through_the_book() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let live = format!("tcp://127.0.0.1:{port}");

        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);
        let dead = format!("tcp://127.0.0.1:{dead_port}");

        let mut dialer = Dialer::new(book(&[&dead, &live]));
        let token = CancellationToken::new();

        assert!(
            dialer
                .dial_next(&token, Duration::from_secs(3))
                .await
                .is_err()
        );
        let (_, addr) = dialer
            .dial_next(&token, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(addr.port, port);
    }

    #[test]
    fn mac_lookup_is_cached() {
        let mut dialer = Dialer::new(book(&["tcp://127.0.0.1:80"]));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let first = dialer.lookup_mac(ip);
        let second = dialer.lookup_mac(ip);
        assert_eq!(first, second);
        assert_eq!(dialer.macs.len(), 1);
    }
}
