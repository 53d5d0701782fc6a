//! Length-prefixed frame codec for the peer-to-peer wire.
//!
//! A frame is `LEN (big-endian u32) || PAYLOAD`. The payload is plaintext
//! when encryption is disabled, otherwise `NONCE(12) || CIPHERTEXT ||
//! TAG(16)` from the configured AEAD cipher with a fresh nonce per frame.
//! LEN counts the bytes after the length field and must satisfy
//! `0 < LEN <= 2*MTU`; anything else fails the connection.
//!
//! There is no out-of-band signalling: control messages are ordinary
//! payloads carrying the `CTRL:` marker (see the proto module).

use crate::codec::errors::FrameError;
use crate::crypto::Cipher;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame payload, sealed or not.
pub const MAX_FRAME_LEN: usize = 2 * crate::MTU as usize;

/// Reads one frame and opens its payload.
///
/// Cancellation-safe only at the frame boundary; callers keep a single
/// reader task per connection so a partial read is never abandoned.
pub async fn read_frame<R>(reader: &mut R, cipher: &dyn Cipher) -> crate::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        return match e.kind() {
            ErrorKind::UnexpectedEof => Err(FrameError::Eof.into()),
            _ => Err(e.into()),
        };
    }

    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len as usize > MAX_FRAME_LEN {
        return Err(FrameError::BadLength(len).into());
    }

    let mut payload = vec![0u8; len as usize];
    if let Err(e) = reader.read_exact(&mut payload).await {
        return match e.kind() {
            ErrorKind::UnexpectedEof => Err(FrameError::Truncated.into()),
            _ => Err(e.into()),
        };
    }

    cipher.open(&mut payload).map_err(FrameError::Crypto)?;
    Ok(payload)
}

/// Seals `payload` and writes one frame, flushing afterwards.
///
/// The caller must hold the connection's writer lock across this call so
/// length and payload never interleave with another producer's bytes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], cipher: &dyn Cipher) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sealed = payload.to_vec();
    cipher.seal(&mut sealed)?;

    if sealed.is_empty() || sealed.len() > MAX_FRAME_LEN {
        return Err(FrameError::BadLength(sealed.len() as u32).into());
    }

    writer.write_all(&(sealed.len() as u32).to_be_bytes()).await?;
    writer.write_all(&sealed).await?;
    writer.flush().await?;
    Ok(())
}
