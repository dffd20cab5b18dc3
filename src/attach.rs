//! Streaming file downloads.
//!
//! The broker answers attachment GETs with a body plus a
//! `Content-Disposition` header carrying the filename, the server-side
//! checksum, and optional third-party metadata. `304 Not Modified` means
//! the cached copy is current and carries no payload.

use std::collections::HashMap;
use std::path::Path;

use http::{Response, StatusCode, header};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::dispatch::AbortOnDrop;
use crate::error::TunnelError;

/// One in-flight download. Owned by the caller; dropping it releases the
/// underlying stream, so consume it exactly once via [`Attachment::copy_to`]
/// or [`Attachment::save_to`] (or drop it for `not_modified` responses).
pub struct Attachment {
    status: StatusCode,
    params: HashMap<String, String>,
    body: Incoming,
    /// Aborts the connection driver when the download is dropped.
    _conn: AbortOnDrop,
}

impl Attachment {
    pub(crate) fn new(resp: Response<Incoming>, conn: AbortOnDrop) -> Attachment {
        let (parts, body) = resp.into_parts();
        let params = parts
            .headers
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(parse_disposition)
            .unwrap_or_default();
        Attachment {
            status: parts.status,
            params,
            body,
            _conn: conn,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The broker saw no change since the fingerprint the agent sent.
    pub fn not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED
    }

    pub fn filename(&self) -> &str {
        self.param("filename").unwrap_or_default()
    }

    /// Server-side checksum (SHA-1 hex) for post-download verification.
    pub fn hash(&self) -> &str {
        self.param("hash").unwrap_or_default()
    }

    /// Third-party metadata riding the disposition header
    /// (`id`, `desc`, `customized`, `extension`, …).
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Stream the body into `dst`, returning the SHA-1 hex of the bytes
    /// written for comparison against [`Attachment::hash`].
    pub async fn copy_to<W>(mut self, dst: &mut W) -> Result<String, TunnelError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut hasher = Sha1::new();
        while let Some(frame) = self.body.frame().await {
            let frame = frame?;
            if let Some(data) = frame.data_ref() {
                hasher.update(data);
                dst.write_all(data).await?;
            }
        }
        dst.flush().await?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Save the body to `path` (create/truncate), returning the SHA-1 hex
    /// of the written file.
    pub async fn save_to(self, path: impl AsRef<Path>) -> Result<String, TunnelError> {
        let mut file = tokio::fs::File::create(path).await?;
        let sum = self.copy_to(&mut file).await?;
        file.sync_all().await?;
        Ok(sum)
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("status", &self.status)
            .field("filename", &self.filename())
            .field("hash", &self.hash())
            .finish()
    }
}

/// Parse `attachment; filename="a.tar"; hash="deadbeef"; id=7` into its
/// key/value parameters. Quotes are optional; the leading disposition type
/// token is skipped; malformed segments are ignored.
pub(crate) fn parse_disposition(value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for segment in value.split(';').skip(1) {
        let Some((key, val)) = segment.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let val = val.trim().trim_matches('"');
        params.insert(key, val.to_owned());
    }
    params
}
