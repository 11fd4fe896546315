//! Protocol error types.

use thiserror::Error;

/// Errors produced while framing or parsing wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad header: read {got} bytes, expected {expected}")]
    BadHeader { got: usize, expected: usize },

    #[error("header declares an empty body")]
    EmptyBody,

    #[error("body too large: {size} bytes (max {max})")]
    TooLarge { size: u32, max: u32 },

    #[error("invalid compression flag: {0}")]
    InvalidCompression(u8),

    #[error("invalid header bitflags: {0:#x}")]
    InvalidFlags(u8),

    #[error("body size mismatch: read {got} bytes, header declared {expected}")]
    SizeMismatch { expected: u32, got: usize },

    #[error("checksum mismatch: computed {actual:#x}, header declared {expected:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("body read exceeded the parse deadline")]
    BodyTimeout,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("malformed dynamic headers: {0}")]
    DynamicHeaders(String),

    #[error("invalid UTF-8 in dynamic headers")]
    InvalidUtf8,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether this error means the peer went away cleanly at a
    /// message boundary, as opposed to a protocol violation mid-message.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed)
    }
}
