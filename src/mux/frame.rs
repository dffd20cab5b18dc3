//! Frame layout and per-session crypto.
//!
//! The wire carries length-delimited sealed frames; after opening, a frame
//! is `cmd(1) | stream_id(4, BE) | payload`. Sealing is XChaCha20-Poly1305
//! under the HKDF-derived session key, fresh nonce per frame, nonce
//! prepended — so a session's traffic is unreadable and unforgeable without
//! the grant passwd.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::secret::{NONCE_LEN, session_key};

/// Payload bytes per PSH frame. Writes larger than this are chunked so a
/// busy stream cannot monopolize the wire.
pub(crate) const MAX_DATA: usize = 16 * 1024;

/// Outer (sealed) frame bound for the length-delimited codec:
/// nonce + header + payload + AEAD tag, with slack.
pub(crate) const MAX_FRAME: usize = MAX_DATA + NONCE_LEN + 5 + 16 + 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cmd {
    /// Open a stream.
    Syn = 1,
    /// Data.
    Psh = 2,
    /// Half-close; the receiver sees EOF after draining.
    Fin = 3,
}

#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub cmd: Cmd,
    pub stream: u32,
    pub data: Bytes,
}

impl Frame {
    pub(crate) fn syn(stream: u32) -> Frame {
        Frame {
            cmd: Cmd::Syn,
            stream,
            data: Bytes::new(),
        }
    }

    pub(crate) fn fin(stream: u32) -> Frame {
        Frame {
            cmd: Cmd::Fin,
            stream,
            data: Bytes::new(),
        }
    }

    pub(crate) fn psh(stream: u32, data: Bytes) -> Frame {
        Frame {
            cmd: Cmd::Psh,
            stream,
            data,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.data.len());
        out.push(self.cmd as u8);
        out.put_u32(self.stream);
        out.extend_from_slice(&self.data);
        out
    }

    fn decode(mut buf: Bytes) -> std::io::Result<Frame> {
        if buf.len() < 5 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "short mux frame",
            ));
        }
        let cmd = match buf.get_u8() {
            1 => Cmd::Syn,
            2 => Cmd::Psh,
            3 => Cmd::Fin,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown mux command {other}"),
                ));
            }
        };
        let stream = buf.get_u32();
        Ok(Frame {
            cmd,
            stream,
            data: buf,
        })
    }
}

/// Seals and opens frames with the session key derived from the grant
/// passwd.
#[derive(Clone)]
pub(crate) struct FrameCrypto {
    aead: XChaCha20Poly1305,
}

impl FrameCrypto {
    pub(crate) fn new(passwd: &[u8]) -> FrameCrypto {
        let key = session_key(passwd);
        FrameCrypto {
            aead: XChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    pub(crate) fn seal(&self, frame: &Frame) -> std::io::Result<Bytes> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, frame.encode().as_slice())
            .map_err(|_| std::io::Error::other("frame seal failed"))?;
        let mut out = BytesMut::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out.freeze())
    }

    pub(crate) fn open(&self, sealed: &[u8]) -> std::io::Result<Frame> {
        if sealed.len() < NONCE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "short sealed frame",
            ));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plain = self
            .aead
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "frame open failed")
            })?;
        Frame::decode(Bytes::from(plain))
    }
}
