//! Inbound path: broker-originated requests served by the agent.
//!
//! The broker dials virtual connections back through the multiplexer;
//! [`StreamListener`] exposes those as an accept loop, and [`InboundServer`]
//! is the seam for whatever serves them. `serve` returning is the signal
//! that the session broke — the supervisor reacts by reconnecting.

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tracing::{debug, trace};

use crate::mux::{MuxSession, MuxStream};

/// Listener façade over [`MuxSession::accept_stream`], shaped so a stock
/// HTTP server loop can drive it unchanged.
pub struct StreamListener {
    mux: MuxSession,
}

impl StreamListener {
    pub fn new(mux: MuxSession) -> StreamListener {
        StreamListener { mux }
    }

    /// Next broker-initiated stream. Errors once the session is down,
    /// which is how serve loops learn to return.
    pub async fn accept(&self) -> std::io::Result<MuxStream> {
        self.mux.accept_stream().await
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.mux.local_addr()
    }

    pub fn close(&self) {
        self.mux.close();
    }
}

/// The opaque inbound HTTP server. `serve` must block until the listener
/// fails and then return; it is restarted with a fresh listener after each
/// reconnect.
#[async_trait]
pub trait InboundServer: Send + Sync + 'static {
    async fn serve(&self, listener: StreamListener) -> std::io::Result<()>;
}

/// Default when the embedder has no inbound surface: accept and drop every
/// stream until the session dies.
pub struct ClosedServer;

#[async_trait]
impl InboundServer for ClosedServer {
    async fn serve(&self, listener: StreamListener) -> std::io::Result<()> {
        loop {
            let stream = listener.accept().await?;
            trace!(stream = stream.id(), "inbound stream refused");
            drop(stream);
        }
    }
}

/// Serves an axum router over every accepted stream, one HTTP/1.1
/// connection per stream.
pub struct RouterServer {
    router: axum::Router,
}

impl RouterServer {
    pub fn new(router: axum::Router) -> RouterServer {
        RouterServer { router }
    }
}

#[async_trait]
impl InboundServer for RouterServer {
    async fn serve(&self, listener: StreamListener) -> std::io::Result<()> {
        loop {
            let stream = listener.accept().await?;
            let service = TowerToHyperService::new(self.router.clone());
            tokio::spawn(async move {
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(error = %e, "inbound connection ended with error");
                }
            });
        }
    }
}
