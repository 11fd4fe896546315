//! Fixed-size binary wire header.
//!
//! Header layout (16 bytes, all integers little-endian):
//!
//! ```text
//! +-------------+----------+---------+--------+----------+--------+
//! | compression | bitflags | session |  size  | checksum |  meta  |
//! |   1 byte    |  1 byte  | 2 bytes | 4 bytes| 4 bytes  | 4 bytes|
//! +-------------+----------+---------+--------+----------+--------+
//! ```
//!
//! `meta` carries the request id on the wire from client to server and an
//! HTTP-style status code from server to client. `size` and `checksum`
//! always describe the body as currently stored; anything that mutates the
//! body must restamp them via [`stamp`].

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};

/// Size of the wire header in bytes (1+1+2+4+4+4 = 16).
pub const HEADER_SIZE: usize = 16;

/// Body compression algorithm selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0,
    Lz4 = 1,
    Zstd = 2,
    /// Legacy "compression turned off" marker; normalized to `None` on read.
    Disabled = 3,
}

impl Compression {
    pub fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            2 => Ok(Compression::Zstd),
            // wire-compatible alias for none
            3 => Ok(Compression::None),
            other => Err(ProtocolError::InvalidCompression(other)),
        }
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Lz4 => write!(f, "lz4"),
            Compression::Zstd => write!(f, "zstd"),
            Compression::Disabled => write!(f, "disabled"),
        }
    }
}

/// Header bitflags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    /// The body region starts with a dynamic-header bag.
    pub const DYNAMIC_HEADERS: u8 = 1 << 0;

    const VALID_MASK: u8 = 0x01;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_dynamic_headers(mut self) -> Self {
        self.0 |= Self::DYNAMIC_HEADERS;
        self
    }

    pub fn has_dynamic_headers(&self) -> bool {
        self.0 & Self::DYNAMIC_HEADERS != 0
    }

    pub fn clear_dynamic_headers(&mut self) {
        self.0 &= !Self::DYNAMIC_HEADERS;
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// The parsed wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub compression: Compression,
    pub flags: HeaderFlags,
    /// Client-assigned correlation id, unique among in-flight requests on
    /// one connection.
    pub session: u16,
    /// Body length in bytes, post-compression.
    pub size: u32,
    /// crc32c of the body, post-compression.
    pub checksum: u32,
    /// Request id (client to server) or status code (server to client).
    pub meta: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            flags: HeaderFlags::new(),
            session: 0,
            size: 0,
            checksum: 0,
            meta: 0,
        }
    }
}

impl Header {
    /// Encodes the header into its 16-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u8(self.compression.as_wire());
        buf.put_u8(self.flags.bits());
        buf.put_u16_le(self.session);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.checksum);
        buf.put_u32_le(self.meta);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decodes a header from exactly [`HEADER_SIZE`] bytes.
    ///
    /// Validates the compression range and flag mask and normalizes the
    /// legacy `disabled` compression marker to `none`. Size validation is
    /// the caller's business: an empty or oversized body is only an error
    /// for inbound messages.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != HEADER_SIZE {
            return Err(ProtocolError::BadHeader {
                got: buf.len(),
                expected: HEADER_SIZE,
            });
        }
        let compression = Compression::from_wire(buf.get_u8())?;
        let flags = HeaderFlags::from_bits(buf.get_u8())?;
        let session = buf.get_u16_le();
        let size = buf.get_u32_le();
        let checksum = buf.get_u32_le();
        let meta = buf.get_u32_le();
        Ok(Self {
            compression,
            flags,
            session,
            size,
            checksum,
            meta,
        })
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "header{{compression:{}, flags:{:#04x}, session:{}, size:{}, checksum:{:#x}, meta:{}}}",
            self.compression,
            self.flags.bits(),
            self.session,
            self.size,
            self.checksum,
            self.meta
        )
    }
}

/// Computes the 32-bit checksum of a body.
pub fn checksum_body(body: &[u8]) -> u32 {
    crc32c::crc32c(body)
}

/// Restamps `size` and `checksum` for the body as currently stored.
///
/// Must be called after every mutation of the body (compression,
/// decompression, sealing the dynamic-header bag).
pub fn stamp(header: &mut Header, body: &[u8]) {
    header.size = body.len() as u32;
    header.checksum = checksum_body(body);
}
