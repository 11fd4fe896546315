//! The letter: header, optional dynamic headers, and a shared body.

use crate::error::ProtocolError;
use crate::header::{Header, HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The unit exchanged on the wire: a fixed header, an optional ordered
/// key/value header map, and a byte-string body.
///
/// The body is an immutable reference-counted buffer: [`Letter::share`]
/// produces a second letter over the same body bytes without copying, while
/// header and dynamic headers are value-copied. Mutation always replaces
/// the body wholesale and restamps the header.
#[derive(Debug, Default)]
pub struct Letter {
    pub header: Header,
    /// Insertion-ordered key/value pairs; only hits the wire when sealed
    /// into the body (see [`crate::Envelope::seal`]).
    pub dynamic_headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Letter {
    pub fn new(header: Header, body: Bytes) -> Self {
        Self {
            header,
            dynamic_headers: Vec::new(),
            body,
        }
    }

    /// Size including the wire header.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Does it have a valid body.
    pub fn empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Returns a copy of this letter sharing the same body bytes.
    ///
    /// Do not modify the body of either copy in place; replace it and
    /// restamp instead.
    pub fn share(&self) -> Letter {
        Letter {
            header: self.header,
            dynamic_headers: self.dynamic_headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Encodes a dynamic-header bag: `u16 count`, then per pair
/// `u16 key_len, key, u16 val_len, val`, all little-endian.
pub fn encode_dynamic_headers(pairs: &[(String, String)], out: &mut BytesMut) {
    out.put_u16_le(pairs.len() as u16);
    for (key, value) in pairs {
        out.put_u16_le(key.len() as u16);
        out.put_slice(key.as_bytes());
        out.put_u16_le(value.len() as u16);
        out.put_slice(value.as_bytes());
    }
}

/// Decodes a dynamic-header bag from the front of a body region.
///
/// Returns the pairs and the number of bytes the bag occupied.
pub fn decode_dynamic_headers(body: &[u8]) -> Result<(Vec<(String, String)>, usize), ProtocolError> {
    let mut buf = body;
    if buf.remaining() < 2 {
        return Err(ProtocolError::DynamicHeaders(
            "truncated header-bag count".to_string(),
        ));
    }
    let count = buf.get_u16_le() as usize;
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let key = take_string(&mut buf)?;
        let value = take_string(&mut buf)?;
        pairs.push((key, value));
    }
    Ok((pairs, body.len() - buf.remaining()))
}

fn take_string(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::DynamicHeaders(
            "truncated header-bag entry length".to_string(),
        ));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::DynamicHeaders(format!(
            "header-bag entry of {} bytes exceeds remaining body",
            len
        )));
    }
    let raw = &buf[..len];
    let s = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string();
    buf.advance(len);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_is_zero_copy() {
        let body = Bytes::from_static(b"shared body bytes");
        let mut letter = Letter::new(Header::default(), body.clone());
        letter
            .dynamic_headers
            .push(("trace".to_string(), "abc".to_string()));

        let copy = letter.share();
        // same allocation
        assert_eq!(copy.body.as_ptr(), letter.body.as_ptr());
        assert_eq!(copy.dynamic_headers, letter.dynamic_headers);
        assert_eq!(copy.size(), HEADER_SIZE + body.len());
    }

    #[test]
    fn test_dynamic_header_bag_roundtrip() {
        let pairs = vec![
            ("fault".to_string(), "sleep:25".to_string()),
            ("trace-id".to_string(), "0f0f".to_string()),
        ];
        let mut buf = BytesMut::new();
        encode_dynamic_headers(&pairs, &mut buf);
        buf.put_slice(b"actual payload");

        let (decoded, consumed) = decode_dynamic_headers(&buf).unwrap();
        assert_eq!(decoded, pairs);
        assert_eq!(&buf[consumed..], b"actual payload");
    }

    #[test]
    fn test_bag_preserves_order() {
        let pairs: Vec<_> = (0..8)
            .map(|i| (format!("k{}", i), format!("v{}", i)))
            .collect();
        let mut buf = BytesMut::new();
        encode_dynamic_headers(&pairs, &mut buf);
        let (decoded, _) = decode_dynamic_headers(&buf).unwrap();
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn test_truncated_bag() {
        let pairs = vec![("key".to_string(), "value".to_string())];
        let mut buf = BytesMut::new();
        encode_dynamic_headers(&pairs, &mut buf);
        let truncated = &buf[..buf.len() - 3];
        assert!(matches!(
            decode_dynamic_headers(truncated),
            Err(ProtocolError::DynamicHeaders(_))
        ));
    }

    #[test]
    fn test_bag_rejects_invalid_utf8() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(1);
        buf.put_u16_le(2);
        buf.put_slice(&[0xFF, 0xFE]);
        buf.put_u16_le(0);
        assert!(matches!(
            decode_dynamic_headers(&buf),
            Err(ProtocolError::InvalidUtf8)
        ));
    }
}
