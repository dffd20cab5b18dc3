//! Request dispatcher.
//!
//! Every operation builds an internal `http://soc/<path>` URL (the host is
//! synthetic — the transport ignores it) and rides a freshly opened
//! multiplexer stream; while a session exists, no dispatcher call ever
//! opens a new broker socket. Callers without an explicit deadline get
//! 30 s, file downloads 10 min. Errors are surfaced, never retried.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HOST, HeaderValue};
use http::{HeaderMap, Method, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::attach::Attachment;
use crate::config::Config;
use crate::error::TunnelError;
use crate::ident::{Identity, SessionGrant};
use crate::mux::MuxStream;
use crate::session::Session;
use crate::wsconn::WsConn;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const ATTACHMENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Aborts a spawned hyper connection driver unless detached. Attachment
/// holds one so dropping the download frees its stream.
pub(crate) struct AbortOnDrop {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl AbortOnDrop {
    pub(crate) fn new(handle: tokio::task::JoinHandle<()>) -> AbortOnDrop {
        AbortOnDrop {
            handle: Some(handle),
        }
    }

    /// Let the driver run to completion on its own.
    pub(crate) fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct Inner {
    cfg: Config,
    cell: ArcSwapOption<Session>,
    token: CancellationToken,
}

/// Handle to the tunnel. Cheap to clone; usable from any task once
/// `open` has returned.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl Tunnel {
    pub(crate) fn new(cfg: Config, token: CancellationToken) -> Tunnel {
        Tunnel {
            inner: Arc::new(Inner {
                cfg,
                cell: ArcSwapOption::empty(),
                token,
            }),
        }
    }

    pub(crate) fn install(&self, session: Arc<Session>) {
        self.inner.cell.store(Some(session));
    }

    pub(crate) fn session(&self) -> Result<Arc<Session>, TunnelError> {
        self.inner
            .cell
            .load_full()
            .ok_or(TunnelError::SessionUninitialized)
    }

    pub(crate) fn current_session(&self) -> Option<Arc<Session>> {
        self.inner.cell.load_full()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Node id assigned by the broker; 0 before the first grant.
    pub fn id(&self) -> i64 {
        self.current_session().map_or(0, |s| s.grant.id)
    }

    /// Egress IP used for the current session.
    pub fn inet(&self) -> Option<IpAddr> {
        self.current_session().map(|s| s.ident.inet)
    }

    /// The broker endpoint the current session is connected to.
    pub fn broker_addr(&self) -> Option<Address> {
        self.current_session().map(|s| s.addr.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_session().map(|s| s.local)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.current_session().map(|s| s.peer)
    }

    /// Business-facing node name, `minion-<egress-ip>-<id>`.
    pub fn node_name(&self) -> String {
        match self.current_session() {
            Some(s) => format!("minion-{}-{}", s.ident.inet, s.grant.id),
            None => "minion-unregistered".to_owned(),
        }
    }

    pub fn ident(&self) -> Option<Identity> {
        self.current_session().map(|s| s.ident.clone())
    }

    pub fn grant(&self) -> Option<SessionGrant> {
        self.current_session().map(|s| s.grant.clone())
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// POST `body` to `path` and hand back the raw response. The response
    /// body streams over the same mux stream; reading it is on the caller.
    pub async fn fetch(
        &self,
        path: &str,
        body: impl Into<Bytes>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<Response<Incoming>, TunnelError> {
        let du = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let (resp, conn) = self
            .guarded(du, self.exchange(Method::POST, path, body.into(), headers))
            .await?;
        conn.detach();
        Ok(resp)
    }

    /// POST and discard the response.
    pub async fn oneway(
        &self,
        path: &str,
        body: impl Into<Bytes>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<(), TunnelError> {
        let du = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let body = body.into();
        self.guarded(du, async {
            let (resp, _conn) = self.exchange(Method::POST, path, body, headers).await?;
            drop(resp);
            Ok(())
        })
        .await
    }

    /// POST `req` as JSON, decode the JSON response.
    pub async fn json<Q, R>(
        &self,
        path: &str,
        req: &Q,
        timeout: Option<Duration>,
    ) -> Result<R, TunnelError>
    where
        Q: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let du = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let body = Bytes::from(serde_json::to_vec(req)?);
        self.guarded(du, async {
            let (resp, _conn) = self
                .exchange(Method::POST, path, body, Some(json_headers()))
                .await?;
            let buf = resp.into_body().collect().await?.to_bytes();
            Ok(serde_json::from_slice(&buf)?)
        })
        .await
    }

    /// POST `req` as JSON, discard the response.
    pub async fn oneway_json<Q>(
        &self,
        path: &str,
        req: &Q,
        timeout: Option<Duration>,
    ) -> Result<(), TunnelError>
    where
        Q: Serialize + ?Sized,
    {
        let du = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let body = Bytes::from(serde_json::to_vec(req)?);
        self.guarded(du, async {
            let (resp, _conn) = self
                .exchange(Method::POST, path, body, Some(json_headers()))
                .await?;
            drop(resp);
            Ok(())
        })
        .await
    }

    /// GET a file download. The deadline (default 10 min) covers reaching
    /// the response headers; the caller owns the streaming body afterwards
    /// and must consume or drop the [`Attachment`] exactly once.
    pub async fn attachment(
        &self,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<Attachment, TunnelError> {
        let du = timeout.unwrap_or(ATTACHMENT_TIMEOUT);
        let (resp, conn) = self
            .guarded(du, self.exchange(Method::GET, path, Bytes::new(), None))
            .await?;
        Ok(Attachment::new(resp, conn))
    }

    /// Upgrade a mux stream to a websocket.
    pub async fn stream(
        &self,
        path: &str,
        headers: Option<HeaderMap>,
    ) -> Result<WebSocketStream<MuxStream>, TunnelError> {
        self.guarded(DEFAULT_TIMEOUT, async {
            let mut request = control_url("ws", path)?.into_client_request()?;
            if let Some(extra) = headers {
                request.headers_mut().extend(extra);
            }
            let session = self.session()?;
            let stream = session.mux.open_stream().await?;
            let (ws, _resp) = tokio_tungstenite::client_async(request, stream).await?;
            Ok(ws)
        })
        .await
    }

    /// Like [`Tunnel::stream`] but shaped as a plain byte pipe, for
    /// TCP-over-tunnel proxying.
    pub async fn stream_conn(
        &self,
        path: &str,
        headers: Option<HeaderMap>,
    ) -> Result<WsConn, TunnelError> {
        Ok(WsConn::new(self.stream(path, headers).await?))
    }

    /// A sub-client that prepends `prefix` to every dispatched path.
    pub fn scoped(&self, prefix: impl Into<String>) -> ScopedTunnel {
        ScopedTunnel {
            tunnel: self.clone(),
            prefix: prefix.into().trim_end_matches('/').to_owned(),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Bound `fut` by the deadline and the supervisor's cancellation.
    async fn guarded<T>(
        &self,
        du: Duration,
        fut: impl Future<Output = Result<T, TunnelError>>,
    ) -> Result<T, TunnelError> {
        tokio::select! {
            biased;
            () = self.inner.token.cancelled() => Err(TunnelError::Cancelled),
            r = tokio::time::timeout(du, fut) => match r {
                Ok(v) => v,
                Err(_) => Err(TunnelError::Timeout),
            },
        }
    }

    /// One request/response over a fresh mux stream.
    async fn exchange(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        headers: Option<HeaderMap>,
    ) -> Result<(Response<Incoming>, AbortOnDrop), TunnelError> {
        let session = self.session()?;
        let stream = session.mux.open_stream().await?;
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream)).await?;
        let conn = AbortOnDrop::new(tokio::spawn(async move {
            let _ = conn.await;
        }));

        // On the wire the target is origin-form; the synthetic host rides
        // in the Host header.
        let url = control_url("http", path)?;
        let target = match url.path_and_query() {
            Some(pq) => Uri::try_from(pq.as_str()).map_err(|e| TunnelError::Request(e.into()))?,
            None => Uri::from_static("/"),
        };
        let mut req = Request::builder()
            .method(method)
            .uri(target)
            .body(Full::new(body))?;
        req.headers_mut().insert(HOST, HeaderValue::from_static("soc"));
        if let Some(extra) = headers {
            req.headers_mut().extend(extra);
        }

        let resp = sender.send_request(req).await?;
        Ok((resp, conn))
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id())
            .field("broker", &self.broker_addr())
            .finish()
    }
}

/// Prefix-scoped sub-client; same operations, every path prefixed.
#[derive(Clone)]
pub struct ScopedTunnel {
    tunnel: Tunnel,
    prefix: String,
}

impl ScopedTunnel {
    fn path(&self, path: &str) -> String {
        join_prefix(&self.prefix, path)
    }

    pub async fn fetch(
        &self,
        path: &str,
        body: impl Into<Bytes>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<Response<Incoming>, TunnelError> {
        self.tunnel.fetch(&self.path(path), body, headers, timeout).await
    }

    pub async fn oneway(
        &self,
        path: &str,
        body: impl Into<Bytes>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<(), TunnelError> {
        self.tunnel.oneway(&self.path(path), body, headers, timeout).await
    }

    pub async fn json<Q, R>(
        &self,
        path: &str,
        req: &Q,
        timeout: Option<Duration>,
    ) -> Result<R, TunnelError>
    where
        Q: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.tunnel.json(&self.path(path), req, timeout).await
    }

    pub async fn oneway_json<Q>(
        &self,
        path: &str,
        req: &Q,
        timeout: Option<Duration>,
    ) -> Result<(), TunnelError>
    where
        Q: Serialize + ?Sized,
    {
        self.tunnel.oneway_json(&self.path(path), req, timeout).await
    }

    pub async fn attachment(
        &self,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<Attachment, TunnelError> {
        self.tunnel.attachment(&self.path(path), timeout).await
    }

    pub async fn stream(
        &self,
        path: &str,
        headers: Option<HeaderMap>,
    ) -> Result<WebSocketStream<MuxStream>, TunnelError> {
        self.tunnel.stream(&self.path(path), headers).await
    }

    pub async fn stream_conn(
        &self,
        path: &str,
        headers: Option<HeaderMap>,
    ) -> Result<WsConn, TunnelError> {
        self.tunnel.stream_conn(&self.path(path), headers).await
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers
}

/// `SCHEME://soc/<path>[?query]`; a missing leading slash is supplied.
fn control_url(scheme: &str, path: &str) -> Result<Uri, TunnelError> {
    let full = if path.starts_with('/') {
        format!("{scheme}://soc{path}")
    } else {
        format!("{scheme}://soc/{path}")
    };
    Uri::try_from(full).map_err(|e| TunnelError::Request(e.into()))
}

fn join_prefix(prefix: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{prefix}{path}")
    } else {
        format!("{prefix}/{path}")
    }
}
