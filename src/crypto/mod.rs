//! Payload sealing for the peer-to-peer wire.
//!
//! Every frame payload travels either in the clear or sealed by an AEAD
//! cipher keyed with the pre-shared key from configuration:
//! - AES-256-GCM (default)
//! - ChaCha20-Poly1305
//! - Plain (passthrough, encryption disabled)

pub mod aes256;
pub mod chacha20;
pub mod plain;

use crate::crypto::aes256::Aes256GcmCipher;
use crate::crypto::chacha20::ChaChaCipher;
use crate::crypto::plain::PlainCipher;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Nonce length prepended to each sealed payload.
pub const NONCE_LEN: usize = 12;
/// Authentication tag length appended by the AEAD ciphers.
pub const TAG_LEN: usize = 16;
/// Total size a sealed payload gains over the plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Symmetric cipher used to seal and open frame payloads.
///
/// Implementations are `Send + Sync` so one instance can be shared by the
/// reader and writer halves of a connection.
pub trait Cipher: Send + Sync {
    /// Seals `data` in place. On return `data` holds
    /// `nonce(12) || ciphertext || tag(16)` with a fresh random nonce.
    fn seal(&self, data: &mut Vec<u8>) -> crate::Result<()>;

    /// Opens `data` in place, verifying the authentication tag.
    fn open(&self, data: &mut Vec<u8>) -> crate::Result<()>;
}

/// Cipher selection as it appears in the daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherConfig {
    /// AES-256-GCM with the pre-shared key.
    Aes256Gcm(String),

    /// ChaCha20-Poly1305 with the pre-shared key.
    ChaCha20Poly1305(String),

    /// No encryption. The handshake advertises this to the peer.
    Plain,
}

impl CipherConfig {
    pub fn is_plain(&self) -> bool {
        matches!(self, CipherConfig::Plain)
    }
}

/// Builds the configured cipher.
pub fn new_cipher(cfg: &CipherConfig) -> Box<dyn Cipher> {
    match cfg {
        CipherConfig::Aes256Gcm(key) => Box::new(Aes256GcmCipher::new(&key_bytes(key))),
        CipherConfig::ChaCha20Poly1305(key) => Box::new(ChaChaCipher::new(&key_bytes(key))),
        CipherConfig::Plain => Box::new(PlainCipher::new()),
    }
}

/// Derives the 32-byte key from the configured string.
///
/// A `base64:` prefix decodes the remainder; anything else is taken as raw
/// bytes, zero-padded or truncated to 32.
pub fn key_bytes(s: &str) -> [u8; 32] {
    let raw = match s.strip_prefix("base64:") {
        Some(b64) => base64::engine::general_purpose::STANDARD
            .decode(b64)
            .unwrap_or_else(|_| s.as_bytes().to_vec()),
        None => s.as_bytes().to_vec(),
    };

    let mut key = [0u8; 32];
    let n = raw.len().min(32);
    key[..n].copy_from_slice(&raw[..n]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_padding_and_truncation() {
        let short = key_bytes("abc");
        assert_eq!(&short[..3], b"abc");
        assert!(short[3..].iter().all(|&b| b == 0));

        let long = key_bytes("0123456789012345678901234567890123456789");
        assert_eq!(&long[..], b"01234567890123456789012345678901");
    }

    #[test]
    fn key_base64() {
        let key = key_bytes("base64:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        assert_eq!(key, [0u8; 32]);
    }
}
