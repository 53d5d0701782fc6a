//! ChaCha20-Poly1305 sealing. Same wire layout as AES-256-GCM, faster on
//! hosts without AES hardware, and built on the same detached in-place
//! construction: encrypt the buffer where it sits, rotate the nonce to
//! the front, append the tag.

use super::{Cipher, NONCE_LEN, SEAL_OVERHEAD, TAG_LEN};
use chacha20poly1305::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce, Tag};

pub struct ChaChaCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }
}

impl Cipher for ChaChaCipher {
    fn seal(&self, data: &mut Vec<u8>) -> crate::Result<()> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, b"", data)
            .map_err(|_| "ChaCha20-Poly1305 seal failed")?;

        data.reserve(SEAL_OVERHEAD);
        data.extend_from_slice(nonce.as_slice());
        data.rotate_right(NONCE_LEN);
        data.extend_from_slice(tag.as_slice());
        Ok(())
    }

    fn open(&self, data: &mut Vec<u8>) -> crate::Result<()> {
        if data.len() < SEAL_OVERHEAD {
            return Err("sealed payload shorter than nonce and tag".into());
        }

        let tag = Tag::clone_from_slice(&data.split_off(data.len() - TAG_LEN));
        let nonce = Nonce::clone_from_slice(&data[..NONCE_LEN]);
        data.drain(..NONCE_LEN);

        self.cipher
            .decrypt_in_place_detached(&nonce, b"", data, &tag)
            .map_err(|_| "ChaCha20-Poly1305 open failed (wrong key or tampered frame)".into())
    }
}
