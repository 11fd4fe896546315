//! # postbus-protocol
//!
//! Wire protocol for postbus.
//!
//! This crate provides:
//! - The fixed 16-byte little-endian wire header
//! - `Letter` (header + dynamic headers + body) and `Envelope` types
//! - Body compression codecs (LZ4, ZSTD)
//! - Checksum helpers and protocol error types

pub mod codec;
pub mod envelope;
pub mod error;
pub mod header;
pub mod letter;

pub use codec::{BodyCodec, Lz4Codec, ZstdCodec};
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use header::{checksum_body, stamp, Compression, Header, HeaderFlags, HEADER_SIZE};
pub use letter::Letter;

/// Maximum body size in bytes (the serialization ceiling, 2 GiB - 1).
///
/// A header whose `size` field exceeds this is rejected before any body
/// bytes are read.
pub const MAX_BODY_SIZE: u32 = i32::MAX as u32;

/// Conventional success status code carried in `meta` on responses.
pub const STATUS_OK: u32 = 200;

/// Status code for a request whose `meta` carried no request id.
pub const STATUS_BAD_REQUEST: u32 = 400;

/// Status code for a request id with no registered handler.
pub const STATUS_NOT_IMPLEMENTED: u32 = 501;
