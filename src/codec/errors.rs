//! Framing errors.
//!
//! A framing error is fatal for its connection: the reader cannot
//! resynchronise a length-prefixed stream after a bad length or a payload
//! that fails authentication, so the caller closes the transport and lets
//! the session teardown path run.

use std::fmt;
use std::fmt::Display;

#[derive(Debug)]
pub enum FrameError {
    /// The peer closed the transport between frames.
    Eof,

    /// The stream ended inside a frame.
    Truncated,

    /// Length prefix outside `0 < LEN <= 2*MTU`.
    BadLength(u32),

    /// AEAD open failed: tampering, corruption, or a key mismatch.
    Crypto(crate::Error),
}

impl std::error::Error for FrameError {}

impl Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::Eof => "connection closed".fmt(fmt),
            FrameError::Truncated => "stream ended mid-frame".fmt(fmt),
            FrameError::BadLength(len) => write!(fmt, "invalid frame length {}", len),
            FrameError::Crypto(e) => write!(fmt, "frame decrypt failed: {}", e),
        }
    }
}
