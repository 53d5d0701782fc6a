//! Passthrough cipher used when encryption is disabled in configuration.
//! Payloads travel as plaintext; the handshake's ENC byte tells the peer.

use crate::crypto::Cipher;

pub struct PlainCipher {}

impl PlainCipher {
    pub fn new() -> Self {
        Self {}
    }
}

impl Cipher for PlainCipher {
    fn seal(&self, _data: &mut Vec<u8>) -> crate::Result<()> {
        Ok(())
    }

    fn open(&self, _data: &mut Vec<u8>) -> crate::Result<()> {
        Ok(())
    }
}

impl Default for PlainCipher {
    fn default() -> Self {
        Self::new()
    }
}
