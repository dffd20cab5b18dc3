use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use brokerlink::{Cipher, Identity, MuxSession, PresharedCipher, SessionGrant};
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use http::header::HOST;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Scripted broker behavior, fixed at startup.
#[derive(Debug, Clone)]
pub struct BrokerScript {
    /// Handshake statuses to hand out, one per attempt, in order. Once the
    /// queue drains every further handshake gets `202`.
    pub handshake_statuses: Vec<u16>,
    /// Node id issued in the grant.
    pub grant_id: i64,
    /// Session key material issued in the grant.
    pub passwd: Vec<u8>,
    /// Attachment served at `GET /file`, if any.
    pub attachment: Option<AttachmentFixture>,
}

impl Default for BrokerScript {
    fn default() -> Self {
        BrokerScript {
            handshake_statuses: Vec::new(),
            grant_id: 7,
            passwd: b"mock-session-passwd".to_vec(),
            attachment: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentFixture {
    pub status: u16,
    pub filename: String,
    pub hash: String,
    pub body: Vec<u8>,
}

struct BrokerState {
    script: Mutex<VecDeque<u16>>,
    grant_id: i64,
    passwd: Vec<u8>,
    cipher: PresharedCipher,
    attachment: Option<AttachmentFixture>,
    /// Decrypted identities, one per handshake attempt (any status).
    identities: Mutex<Vec<Identity>>,
    /// Live broker-side sessions, oldest first.
    sessions: Mutex<Vec<MuxSession>>,
    ping_count: AtomicU64,
    /// When set, inbound streams are dropped instead of served.
    blackhole: AtomicBool,
}

/// A mock broker bound to a random localhost port.
///
/// Each test spins up its own instance; connections are handled in
/// background tasks owned by the accept loop.
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    _accept: tokio::task::JoinHandle<()>,
}

impl MockBroker {
    pub async fn start(script: BrokerScript) -> std::io::Result<MockBroker> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(BrokerState {
            script: Mutex::new(script.handshake_statuses.into_iter().collect()),
            grant_id: script.grant_id,
            passwd: script.passwd,
            cipher: PresharedCipher::default(),
            attachment: script.attachment,
            identities: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            ping_count: AtomicU64::new(0),
            blackhole: AtomicBool::new(false),
        });

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let state = accept_state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_agent(stream, peer, state).await {
                                // Agents drop connections in failure tests.
                                debug!(error = %e, "agent connection ended");
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockBroker {
            addr,
            state,
            _accept: accept,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `tcp://127.0.0.1:<port>` — feed this to the agent's config.
    pub fn address(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Identities received so far, in handshake order.
    pub fn identities(&self) -> Vec<Identity> {
        self.state.identities.lock().unwrap().clone()
    }

    pub fn handshake_count(&self) -> usize {
        self.state.identities.lock().unwrap().len()
    }

    /// Completed (202) sessions so far, including dead ones.
    pub fn session_count(&self) -> usize {
        self.state.sessions.lock().unwrap().len()
    }

    pub fn ping_count(&self) -> u64 {
        self.state.ping_count.load(Ordering::Relaxed)
    }

    /// Drop inbound streams instead of serving them, which fails agent
    /// requests (heartbeats included) fast.
    pub fn set_blackhole(&self, on: bool) {
        self.state.blackhole.store(on, Ordering::Relaxed);
    }

    /// Tear down every live session, simulating a mid-stream connection
    /// reset from the broker side.
    pub fn kill_sessions(&self) {
        for session in self.state.sessions.lock().unwrap().iter() {
            session.close();
        }
    }

    /// Dial an HTTP request into the agent over the newest session, the
    /// way the real broker pushes tasks.
    pub async fn dial_agent(
        &self,
        method: http::Method,
        path: &str,
        body: Bytes,
    ) -> std::io::Result<(StatusCode, Bytes)> {
        let session = self
            .state
            .sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "no session"))?;
        let stream = session.open_stream().await?;
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
                .await
                .map_err(std::io::Error::other)?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "agent")
            .body(Full::new(body))
            .expect("request construction");
        let resp = sender
            .send_request(req)
            .await
            .map_err(std::io::Error::other)?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(std::io::Error::other)?
            .to_bytes();
        Ok((status, bytes))
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_agent(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<BrokerState>,
) -> std::io::Result<()> {
    let local = stream.local_addr()?;
    let identity = read_handshake(&mut stream, &state).await?;
    state.identities.lock().unwrap().push(identity);

    let status = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(202);

    if status != 202 {
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Error");
        let body = format!("{{\"message\":\"{}\"}}", reason.to_ascii_lowercase());
        let head = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body.as_bytes()).await?;
        stream.flush().await?;
        return Ok(());
    }

    let grant = SessionGrant {
        id: state.grant_id,
        passwd: state.passwd.clone(),
    };
    let body = state
        .cipher
        .encrypt(&serde_json::to_vec(&grant).expect("grant to json"))
        .expect("grant encryption");
    let head = format!(
        "HTTP/1.1 202 Accepted\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;

    let session = MuxSession::server(stream, &state.passwd, local, peer);
    state.sessions.lock().unwrap().push(session.clone());

    // Serve the agent's outbound requests until the session dies.
    let router = control_router(state.clone());
    loop {
        let inbound = match session.accept_stream().await {
            Ok(s) => s,
            Err(_) => break,
        };
        if state.blackhole.load(Ordering::Relaxed) {
            drop(inbound);
            continue;
        }
        let service = TowerToHyperService::new(router.clone());
        tokio::spawn(async move {
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(inbound), service)
                .with_upgrades()
                .await;
        });
    }
    Ok(())
}

/// Parse the one-shot CONNECT request and decrypt the identity it carries.
async fn read_handshake(
    stream: &mut TcpStream,
    state: &BrokerState,
) -> std::io::Result<Identity> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let (head_end, body_len) = loop {
        if let Some(parsed) = parse_head(&buf)? {
            break parsed;
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "agent closed before handshake",
            ));
        }
    };
    while buf.len() < head_end + body_len {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "agent closed mid-handshake",
            ));
        }
    }

    let plain = state
        .cipher
        .decrypt(&buf[head_end..head_end + body_len])
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    serde_json::from_slice(&plain)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn parse_head(buf: &[u8]) -> std::io::Result<Option<(usize, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(end)) => {
            if req.method != Some("CONNECT") || req.path != Some("/api/v1/minion") {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected handshake {:?} {:?}", req.method, req.path),
                ));
            }
            let body_len = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            Ok(Some((end, body_len)))
        }
        Err(e) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad handshake request: {e}"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Broker-side control endpoints (served to the agent over the mux)
// ---------------------------------------------------------------------------

fn control_router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/api/v1/minion/ping", post(ping))
        .route("/echo/json", post(echo_json))
        .route("/echo/body", post(echo_body))
        .route("/file", get(file))
        .route("/ws/echo", get(ws_echo))
        .with_state(state)
}

async fn ping(State(state): State<Arc<BrokerState>>) -> StatusCode {
    state.ping_count.fetch_add(1, Ordering::Relaxed);
    StatusCode::OK
}

async fn echo_json(
    axum::Json(value): axum::Json<serde_json::Value>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "echo": value }))
}

async fn echo_body(body: Bytes) -> Bytes {
    body
}

async fn file(State(state): State<Arc<BrokerState>>) -> Response {
    let Some(fixture) = state.attachment.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let disposition = format!(
        "attachment; filename=\"{}\"; hash=\"{}\"; id=42; customized=fleet-a",
        fixture.filename, fixture.hash
    );
    let status = StatusCode::from_u16(fixture.status).unwrap_or(StatusCode::OK);
    let body = if status == StatusCode::NOT_MODIFIED {
        Vec::new()
    } else {
        fixture.body
    };
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_DISPOSITION, disposition)
        .body(axum::body::Body::from(body))
        .expect("attachment response")
}

async fn ws_echo(upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(|mut socket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            let reply = match msg {
                WsMessage::Binary(data) => WsMessage::Binary(data),
                WsMessage::Text(text) => WsMessage::Text(text),
                WsMessage::Close(_) => break,
                other => {
                    let _ = other;
                    continue;
                }
            };
            if socket.send(reply).await.is_err() {
                break;
            }
        }
    })
}
