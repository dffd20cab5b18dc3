//! Stream multiplexer.
//!
//! One authenticated socket is split into many concurrent logical streams.
//! Either side may open streams (agent ids odd, broker ids even) and either
//! side may accept. Two pumps own the socket halves: the write pump seals
//! and sends frames queued by streams, the read pump opens incoming frames
//! and routes payloads to per-stream channels. All payloads are encrypted
//! with the session key derived from the grant passwd.
//!
//! Closing the session (explicitly, or because a pump hits an IO error)
//! cancels both pumps, fails `open_stream`/`accept_stream`, EOFs every
//! reader, and errors every writer.

mod frame;
mod stream;

pub use stream::MuxStream;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

use frame::{Cmd, Frame, FrameCrypto, MAX_FRAME};

/// Sealed frames queued towards the write pump.
const FRAME_BUFFER: usize = 512;
/// Per-stream inbound payload buffer (chunks, not bytes).
const STREAM_BUFFER: usize = 256;
/// Peer-opened streams waiting in `accept_stream`.
const ACCEPT_BUFFER: usize = 64;

pub(crate) struct Shared {
    frame_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    next_id: AtomicU32,
    shutdown: CancellationToken,
}

impl Shared {
    fn register(&self, id: u32) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.streams
            .lock()
            .expect("mux stream table poisoned")
            .insert(id, tx);
        rx
    }

    pub(crate) fn forget(&self, id: u32) {
        self.streams
            .lock()
            .expect("mux stream table poisoned")
            .remove(&id);
    }

    pub(crate) fn try_send_fin(&self, id: u32) {
        let _ = self.frame_tx.try_send(Frame::fin(id));
    }

    fn inbound_sender(&self, id: u32) -> Option<mpsc::Sender<Bytes>> {
        self.streams
            .lock()
            .expect("mux stream table poisoned")
            .get(&id)
            .cloned()
    }

    fn clear(&self) {
        self.streams
            .lock()
            .expect("mux stream table poisoned")
            .clear();
    }
}

/// Handle to one live multiplexed session. Cheap to clone; all clones
/// observe the same shutdown.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
    accept: Arc<tokio::sync::Mutex<mpsc::Receiver<MuxStream>>>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl MuxSession {
    /// Agent side: opens odd stream ids.
    pub fn client<T>(io: T, passwd: &[u8], local: SocketAddr, peer: SocketAddr) -> MuxSession
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        MuxSession::spawn(io, passwd, 1, local, peer)
    }

    /// Broker side: opens even stream ids. The agent only needs this for
    /// in-process test brokers, but the roles are symmetric.
    pub fn server<T>(io: T, passwd: &[u8], local: SocketAddr, peer: SocketAddr) -> MuxSession
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        MuxSession::spawn(io, passwd, 2, local, peer)
    }

    fn spawn<T>(
        io: T,
        passwd: &[u8],
        first_id: u32,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> MuxSession
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let crypto = FrameCrypto::new(passwd);
        let framed = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME)
            .new_framed(io);
        let (mut sink, mut source) = framed.split();

        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_BUFFER);
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(ACCEPT_BUFFER);
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            frame_tx,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(first_id),
            shutdown: shutdown.clone(),
        });

        // Write pump: seal queued frames onto the socket.
        let wp_token = shutdown.clone();
        let wp_crypto = crypto.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = wp_token.cancelled() => break,
                    f = frame_rx.recv() => match f {
                        Some(f) => f,
                        None => break,
                    },
                };
                let sealed = match wp_crypto.seal(&frame) {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(error = %e, "mux seal failed");
                        wp_token.cancel();
                        break;
                    }
                };
                if let Err(e) = sink.send(sealed).await {
                    debug!(error = %e, "mux write failed");
                    wp_token.cancel();
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Read pump: open incoming frames and route them.
        let rp_token = shutdown.clone();
        let rp_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    () = rp_token.cancelled() => break,
                    i = source.next() => i,
                };
                let buf = match item {
                    Some(Ok(buf)) => buf,
                    Some(Err(e)) => {
                        debug!(error = %e, "mux read failed");
                        break;
                    }
                    None => {
                        trace!("mux peer closed");
                        break;
                    }
                };
                let frame = match crypto.open(&buf) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(error = %e, "mux frame rejected");
                        break;
                    }
                };
                match frame.cmd {
                    Cmd::Syn => {
                        let rx = rp_shared.register(frame.stream);
                        let stream = MuxStream::new(
                            frame.stream,
                            rx,
                            PollSender::new(rp_shared.frame_tx.clone()),
                            rp_shared.clone(),
                        );
                        if accept_tx.send(stream).await.is_err() {
                            // Nobody accepting anymore; the stream's Drop
                            // FINs it back to the peer.
                            trace!(stream = frame.stream, "inbound stream dropped");
                        }
                    }
                    Cmd::Psh => {
                        if let Some(tx) = rp_shared.inbound_sender(frame.stream) {
                            let delivered = tokio::select! {
                                () = rp_token.cancelled() => break,
                                r = tx.send(frame.data) => r,
                            };
                            if delivered.is_err() {
                                rp_shared.forget(frame.stream);
                                rp_shared.try_send_fin(frame.stream);
                            }
                        }
                    }
                    Cmd::Fin => rp_shared.forget(frame.stream),
                }
            }
            rp_token.cancel();
            // Dropping the senders EOFs every open reader.
            rp_shared.clear();
        });

        MuxSession {
            shared,
            accept: Arc::new(tokio::sync::Mutex::new(accept_rx)),
            local,
            peer,
        }
    }

    /// Open a locally-initiated stream. The peer learns about it on the
    /// first frame; no round trip.
    pub async fn open_stream(&self) -> std::io::Result<MuxStream> {
        if self.is_closed() {
            return Err(closed_err());
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let rx = self.shared.register(id);
        if self.shared.frame_tx.send(Frame::syn(id)).await.is_err() {
            self.shared.forget(id);
            return Err(closed_err());
        }
        Ok(MuxStream::new(
            id,
            rx,
            PollSender::new(self.shared.frame_tx.clone()),
            self.shared.clone(),
        ))
    }

    /// Wait for the next peer-initiated stream. Errors once the session is
    /// closed or broken.
    pub async fn accept_stream(&self) -> std::io::Result<MuxStream> {
        let mut accept = self.accept.lock().await;
        tokio::select! {
            () = self.shared.shutdown.cancelled() => Err(closed_err()),
            s = accept.recv() => s.ok_or_else(closed_err),
        }
    }

    /// Tear the session down: all in-flight streams fail, and both
    /// `open_stream` and `accept_stream` return errors from now on.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves when the session dies, whatever the cause.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_err() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mux session closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn pair() -> (MuxSession, MuxSession) {
        let (a, b) = duplex(256 * 1024);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        (
            MuxSession::client(a, b"test-passwd", addr, addr),
            MuxSession::server(b, b"test-passwd", addr, addr),
        )
    }

    #[tokio::test]
    async fn open_accept_and_transfer_both_directions() {
        let (client, server) = pair();

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"ping from client").await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 16];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping from client");

        inbound.write_all(b"pong from server").await.unwrap();
        let mut buf = [0u8; 16];
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong from server");
    }

    #[tokio::test]
    async fn server_initiated_streams_reach_the_client_acceptor() {
        let (client, server) = pair();

        let mut out = server.open_stream().await.unwrap();
        out.write_all(b"broker calling").await.unwrap();

        let mut inbound = client.accept_stream().await.unwrap();
        assert_eq!(inbound.id() % 2, 0, "broker streams use even ids");
        let mut buf = vec![0u8; 14];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"broker calling");
    }

    #[tokio::test]
    async fn concurrent_streams_do_not_interleave_payloads() {
        let (client, server) = pair();

        let echo = tokio::spawn(async move {
            let mut tasks = Vec::new();
            for _ in 0..8 {
                let s = server.accept_stream().await.unwrap();
                tasks.push(tokio::spawn(async move {
                    let (mut rd, mut wr) = tokio::io::split(s);
                    tokio::io::copy(&mut rd, &mut wr).await.unwrap();
                }));
            }
            for t in tasks {
                t.await.unwrap();
            }
        });

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let sess = client.clone();
            tasks.push(tokio::spawn(async move {
                let mut s = sess.open_stream().await.unwrap();
                // Spans several PSH chunks.
                let payload = vec![i; 40 * 1024];
                s.write_all(&payload).await.unwrap();
                s.shutdown().await.unwrap();
                let mut back = Vec::new();
                s.read_to_end(&mut back).await.unwrap();
                assert_eq!(back, payload);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn fin_produces_eof_after_draining() {
        let (client, server) = pair();

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"tail").await.unwrap();
        out.shutdown().await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut all = Vec::new();
        inbound.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"tail");
    }

    #[tokio::test]
    async fn close_fails_new_and_inflight_streams() {
        let (client, server) = pair();
        let mut stream = client.open_stream().await.unwrap();
        let _inbound = server.accept_stream().await.unwrap();

        client.close();
        assert!(client.is_closed());
        assert!(client.open_stream().await.is_err());
        assert!(client.accept_stream().await.is_err());

        // The write pump is gone; in-flight writers fail.
        let mut failed = false;
        for _ in 0..64 {
            if stream.write_all(b"x").await.is_err() {
                failed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(failed, "writes should fail after close");
    }

    #[tokio::test]
    async fn peer_socket_loss_closes_the_session() {
        let (a, b) = duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let client = MuxSession::client(a, b"pw", addr, addr);
        drop(b);

        // Ping the write pump so the broken socket is noticed.
        let _ = client.open_stream().await;
        tokio::time::timeout(std::time::Duration::from_secs(2), client.closed())
            .await
            .expect("session should observe the dead socket");
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn mismatched_passwords_cannot_exchange_frames() {
        let (a, b) = duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let client = MuxSession::client(a, b"passwd-one", addr, addr);
        let server = MuxSession::server(b, b"passwd-two", addr, addr);

        let _ = client.open_stream().await.unwrap();
        // The server read pump rejects the frame and the session dies.
        tokio::time::timeout(std::time::Duration::from_secs(2), server.closed())
            .await
            .expect("server session should reject foreign frames");
    }
}
