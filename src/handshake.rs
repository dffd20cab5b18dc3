//! Identity exchange on the raw socket.
//!
//! Before any multiplexing exists, the agent writes a single hand-built
//! HTTP/1.1 request and reads a single response:
//!
//! ```text
//! CONNECT /api/v1/minion HTTP/1.1
//! Host: <endpoint-name>
//! Content-Length: <n>
//!
//! <encrypted identity JSON>
//! ```
//!
//! `202 Accepted` carries the encrypted [`SessionGrant`]; any other status
//! becomes an [`HttpError`] with up to 100 KiB of body. The caller wraps
//! the whole exchange in its 5-second deadline.

use bytes::{Buf, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::error::{HttpError, TunnelError};
use crate::ident::{Identity, SessionGrant};
use crate::secret::Cipher;

pub(crate) const ENDPOINT: &str = "/api/v1/minion";
/// Response bodies are read to at most this many bytes.
const MAX_BODY: usize = 100 * 1024;
/// Guard against a peer that streams garbage instead of a header block.
const MAX_HEAD: usize = 16 * 1024;

/// Run the exchange. Any read or parse failure is a retriable
/// [`TunnelError::Handshake`]; a grant is only adopted from a fully
/// parsed, decrypted `202` body.
pub(crate) async fn perform<S>(
    io: &mut S,
    addr: &Address,
    ident: &Identity,
    cipher: &dyn Cipher,
) -> Result<SessionGrant, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = cipher.encrypt(&serde_json::to_vec(ident)?)?;
    let head = format!(
        "CONNECT {ENDPOINT} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n\r\n",
        addr.name,
        body.len(),
    );
    io.write_all(head.as_bytes()).await?;
    io.write_all(&body).await?;
    io.flush().await?;

    let (code, mut body) = read_response(io).await?;
    if code == StatusCode::ACCEPTED {
        let grant: SessionGrant = serde_json::from_slice(&cipher.decrypt(&body)?)?;
        return Ok(grant);
    }
    Err(TunnelError::Http(HttpError {
        code,
        body: body.split().freeze(),
    }))
}

async fn read_response<S>(io: &mut S) -> Result<(StatusCode, BytesMut), TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let (code, header_len, content_len) = loop {
        if let Some(parsed) = try_parse(&buf)? {
            break parsed;
        }
        if buf.len() > MAX_HEAD {
            return Err(TunnelError::Handshake(
                "response header block too large".to_owned(),
            ));
        }
        if io.read_buf(&mut buf).await? == 0 {
            return Err(TunnelError::Handshake(
                "connection closed before handshake response".to_owned(),
            ));
        }
    };

    buf.advance(header_len);
    let want = content_len.map(|n| n.min(MAX_BODY));
    loop {
        match want {
            Some(n) if buf.len() >= n => {
                buf.truncate(n);
                break;
            }
            None if buf.len() >= MAX_BODY => {
                buf.truncate(MAX_BODY);
                break;
            }
            _ => {}
        }
        if io.read_buf(&mut buf).await? == 0 {
            match want {
                // Without a Content-Length the body runs to EOF.
                None => break,
                Some(n) => {
                    return Err(TunnelError::Handshake(format!(
                        "handshake body truncated ({} of {} bytes)",
                        buf.len(),
                        n
                    )));
                }
            }
        }
    }

    Ok((code, buf))
}

/// One parse attempt over the buffered bytes. `Ok(None)` means more input
/// is needed.
fn try_parse(buf: &[u8]) -> Result<Option<(StatusCode, usize, Option<usize>)>, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(header_len)) => {
            let raw = resp
                .code
                .ok_or_else(|| TunnelError::Handshake("response missing status".to_owned()))?;
            let code = StatusCode::from_u16(raw)
                .map_err(|_| TunnelError::Handshake(format!("bad status {raw}")))?;
            let content_len = resp
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .and_then(|v| v.trim().parse::<usize>().ok());
            Ok(Some((code, header_len, content_len)))
        }
        Err(e) => Err(TunnelError::Handshake(format!("bad response: {e}"))),
    }
}
