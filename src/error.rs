//! Error taxonomy for the tunnel client.
//!
//! Two shapes matter to callers: [`HttpError`] carries a broker-side HTTP
//! status + body from the handshake (and is how terminal `406` and
//! duplicate-registration `409` travel through the supervisor), and
//! [`TunnelError`] is the top-level error for everything else.

use bytes::Bytes;
use http::StatusCode;

/// A non-`202` handshake response from the broker.
///
/// The body is captured verbatim (capped at 100 KiB by the handshake
/// reader) so operators can see the broker's problem payload.
#[derive(Debug, Clone, thiserror::Error)]
#[error("broker replied {code}: {}", self.message())]
pub struct HttpError {
    pub code: StatusCode,
    pub body: Bytes,
}

impl HttpError {
    /// `406 Not Acceptable`: the node was administratively removed.
    /// The supervisor must stop retrying.
    pub fn is_not_acceptable(&self) -> bool {
        self.code == StatusCode::NOT_ACCEPTABLE
    }

    /// `409 Conflict`: duplicate registration; triggers the one-shot
    /// machine-id rebuild.
    pub fn is_conflict(&self) -> bool {
        self.code == StatusCode::CONFLICT
    }

    /// Body rendered as lossy UTF-8, trimmed for log lines.
    pub fn message(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        let text = text.trim();
        if text.len() > 256 {
            let mut end = 256;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &text[..end])
        } else {
            text.to_owned()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Caller input: nothing to dial.
    #[error("no broker addresses configured")]
    EmptyAddresses,

    /// Caller input: an address string that cannot be normalized.
    #[error("invalid broker address '{0}'")]
    InvalidAddress(String),

    /// A dispatcher call raced ahead of the first successful connect.
    #[error("session uninitialized")]
    SessionUninitialized,

    /// The parent cancellation token fired; terminal for the supervisor.
    #[error("operation cancelled")]
    Cancelled,

    /// A synthesized or caller-supplied deadline elapsed.
    #[error("deadline exceeded")]
    Timeout,

    /// Broker answered the handshake with a non-`202` status.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Malformed handshake exchange (short read, unparseable response,
    /// oversized header block).
    #[error("handshake: {0}")]
    Handshake(String),

    /// Envelope or frame crypto failure.
    #[error("crypto: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// hyper-level transport failure on a multiplexed request.
    #[error("transport: {0}")]
    Transport(#[from] hyper::Error),

    /// Request construction failure (bad path, bad header value).
    #[error("request: {0}")]
    Request(#[from] http::Error),

    #[error("websocket: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl TunnelError {
    /// Terminal errors stop the supervisor instead of entering backoff.
    pub(crate) fn is_terminal(&self) -> bool {
        match self {
            TunnelError::Cancelled => true,
            TunnelError::Http(he) => he.is_not_acceptable(),
            _ => false,
        }
    }
}
