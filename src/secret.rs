//! Handshake envelope and session-key material.
//!
//! Two layers of crypto exist. The *envelope* ([`Cipher`]) protects the
//! identity/grant JSON exchanged during the handshake and is keyed by
//! pre-shared material both sides already hold. The *session* layer seals
//! every multiplexer frame with a key derived from the `passwd` the broker
//! issues in the grant (see [`session_key`] and the mux frame codec).

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::TunnelError;

/// XChaCha20-Poly1305 nonce length; sealed payloads are `nonce || ciphertext`.
pub const NONCE_LEN: usize = 24;

/// Envelope crypto seam. Implementations seal/open the handshake JSON
/// payloads; both agent and broker must agree on the keying.
pub trait Cipher: Send + Sync + 'static {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, TunnelError>;
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, TunnelError>;
}

/// Default envelope: XChaCha20-Poly1305 under a pre-shared 32-byte key,
/// fresh random nonce per message, nonce prepended to the ciphertext.
pub struct PresharedCipher {
    aead: XChaCha20Poly1305,
}

impl PresharedCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        PresharedCipher {
            aead: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }
}

impl Default for PresharedCipher {
    fn default() -> Self {
        // Baked-in envelope key. Deployments that rotate it supply their
        // own via `PresharedCipher::new` or a custom `Cipher`.
        const BUILTIN: [u8; 32] = [
            0x6b, 0x1d, 0xc9, 0x4a, 0x3f, 0x82, 0x10, 0xe5, 0x77, 0x0c, 0xab, 0x39, 0xd4, 0x5e,
            0x91, 0x28, 0x84, 0xf0, 0x2b, 0x66, 0x1a, 0xcd, 0x53, 0x97, 0x40, 0xee, 0x08, 0xb2,
            0x75, 0x3c, 0xd1, 0x9f,
        ];
        PresharedCipher::new(&BUILTIN)
    }
}

impl Cipher for PresharedCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plain)
            .map_err(|_| TunnelError::Crypto("envelope seal failed".to_owned()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if sealed.len() < NONCE_LEN {
            return Err(TunnelError::Crypto("envelope too short".to_owned()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| TunnelError::Crypto("envelope open failed".to_owned()))
    }
}

/// Derive the 32-byte frame key for one session from the broker-issued
/// `passwd`. Both sides derive independently, so the raw passwd never
/// touches the wire again after the handshake.
pub(crate) fn session_key(passwd: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, passwd);
    let mut okm = [0u8; 32];
    hk.expand(b"brokerlink/1 frame key", &mut okm)
        .expect("32 bytes is a valid hkdf-sha256 output length");
    okm
}
