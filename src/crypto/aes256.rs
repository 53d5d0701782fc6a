//! AES-256-GCM sealing, the default cipher for the overlay wire.
//!
//! Works in place with the detached-tag API: the packet buffer is
//! encrypted where it sits, then the nonce is rotated to the front and
//! the tag appended, yielding `nonce || ciphertext || tag` without a
//! second allocation per frame.

use super::{Cipher, NONCE_LEN, SEAL_OVERHEAD, TAG_LEN};
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce, Tag};

pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }
}

impl Cipher for Aes256GcmCipher {
    fn seal(&self, data: &mut Vec<u8>) -> crate::Result<()> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, b"", data)
            .map_err(|_| "AES-256-GCM seal failed")?;

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
            .map_err(|_| "AES-256-GCM open failed (wrong key or tampered frame)".into())
    }
}
