//! One logical stream inside a session.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use super::Shared;
use super::frame::{Frame, MAX_DATA};

/// A bidirectional byte stream multiplexed over the session socket.
///
/// Reads deliver the peer's PSH payloads in order and return EOF once the
/// peer sends FIN (or the session dies). Writes are chunked into PSH
/// frames; `shutdown` sends FIN. Dropping the stream FINs it implicitly
/// and unregisters it from the session.
pub struct MuxStream {
    id: u32,
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    writer: PollSender<Frame>,
    shared: Arc<Shared>,
    fin_sent: bool,
}

impl MuxStream {
    pub(super) fn new(
        id: u32,
        rx: mpsc::Receiver<Bytes>,
        writer: PollSender<Frame>,
        shared: Arc<Shared>,
    ) -> MuxStream {
        MuxStream {
            id,
            rx,
            pending: Bytes::new(),
            writer,
            shared,
            fin_sent: false,
        }
    }

    /// Session-scoped stream id (odd = agent-opened, even = broker-opened).
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.id).finish()
    }
}

fn broken() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mux session closed")
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.pending.is_empty() {
                let n = me.pending.len().min(buf.remaining());
                buf.put_slice(&me.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(me.rx.poll_recv(cx)) {
                Some(chunk) => me.pending = chunk,
                // Channel closed: peer FIN or session teardown — EOF.
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        if me.fin_sent {
            return Poll::Ready(Err(broken()));
        }
        if ready!(me.writer.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(broken()));
        }
        let n = buf.len().min(MAX_DATA);
        let frame = Frame::psh(me.id, Bytes::copy_from_slice(&buf[..n]));
        if me.writer.send_item(frame).is_err() {
            return Poll::Ready(Err(broken()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Frames are handed to the write pump on send; nothing buffers here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        if me.fin_sent {
            return Poll::Ready(Ok(()));
        }
        // A dead session means there is nothing left to half-close.
        if ready!(me.writer.poll_reserve(cx)).is_ok() {
            let _ = me.writer.send_item(Frame::fin(me.id));
        }
        me.fin_sent = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.forget(self.id);
        if !self.fin_sent {
            self.shared.try_send_fin(self.id);
        }
    }
}
