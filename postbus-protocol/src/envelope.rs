//! Outbound messages.

use crate::header::{stamp, HEADER_SIZE};
use crate::letter::{encode_dynamic_headers, Letter};
use bytes::{BufMut, Bytes, BytesMut};

/// An outbound message: a letter not yet written to the wire.
///
/// Lifecycle: created by a caller (client) or a handler (server), sealed,
/// run through the outgoing filters, serialized, dropped.
#[derive(Debug, Default)]
pub struct Envelope {
    pub letter: Letter,
}

impl Envelope {
    /// Creates an envelope around a body.
    pub fn new(body: Bytes) -> Self {
        let mut letter = Letter::default();
        stamp(&mut letter.header, &body);
        letter.body = body;
        Self { letter }
    }

    pub fn from_letter(letter: Letter) -> Self {
        Self { letter }
    }

    /// Stamps the request id; used on the client-sender side.
    pub fn set_request_id(&mut self, request_id: u32) {
        self.letter.header.meta = request_id;
    }

    /// Stamps an HTTP-style status code; used on the server-reply side.
    pub fn set_status(&mut self, status: u32) {
        self.letter.header.meta = status;
    }

    /// Stamps the correlation session id.
    pub fn set_session(&mut self, session: u16) {
        self.letter.header.session = session;
    }

    /// Adds a key=value pair ala HTTP/1.1, e.g. trace information.
    ///
    /// The pairs are carried in the body region once the envelope is
    /// sealed; sealing happens automatically on send.
    pub fn add_dynamic_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.letter
            .dynamic_headers
            .push((key.into(), value.into()));
    }

    /// Size including the wire header.
    pub fn size(&self) -> usize {
        self.letter.size()
    }

    /// Read-only copy: headers value-copied, body shared.
    pub fn share(&self) -> Envelope {
        Envelope {
            letter: self.letter.share(),
        }
    }

    /// Materializes pending dynamic headers into the body region and
    /// restamps size and checksum.
    ///
    /// Runs before the outgoing filters so a compression filter covers the
    /// bag too. Idempotent when no dynamic headers are pending.
    pub fn seal(&mut self) {
        if !self.letter.dynamic_headers.is_empty() {
            let pairs = std::mem::take(&mut self.letter.dynamic_headers);
            let mut body = BytesMut::with_capacity(self.letter.body.len() + 64);
            encode_dynamic_headers(&pairs, &mut body);
            body.put_slice(&self.letter.body);
            self.letter.body = body.freeze();
            self.letter.header.flags = self.letter.header.flags.with_dynamic_headers();
        }
        stamp(&mut self.letter.header, &self.letter.body);
    }

    /// Encodes the wire header block for this envelope.
    pub fn encode_header(&self) -> [u8; HEADER_SIZE] {
        self.letter.header.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::checksum_body;
    use crate::letter::decode_dynamic_headers;

    #[test]
    fn test_new_stamps_header() {
        let e = Envelope::new(Bytes::from_static(b"hello"));
        assert_eq!(e.letter.header.size, 5);
        assert_eq!(e.letter.header.checksum, checksum_body(b"hello"));
    }

    #[test]
    fn test_meta_mutators() {
        let mut e = Envelope::new(Bytes::from_static(b"x"));
        e.set_request_id(42);
        assert_eq!(e.letter.header.meta, 42);
        e.set_status(200);
        assert_eq!(e.letter.header.meta, 200);
        e.set_session(7);
        assert_eq!(e.letter.header.session, 7);
    }

    #[test]
    fn test_seal_without_headers_is_stamp_only() {
        let mut e = Envelope::new(Bytes::from_static(b"body"));
        let before = e.letter.body.clone();
        e.seal();
        e.seal();
        assert_eq!(e.letter.body, before);
        assert!(!e.letter.header.flags.has_dynamic_headers());
    }

    #[test]
    fn test_seal_materializes_bag() {
        let mut e = Envelope::new(Bytes::from_static(b"payload"));
        e.add_dynamic_header("fault", "error");
        e.seal();

        assert!(e.letter.header.flags.has_dynamic_headers());
        assert!(e.letter.dynamic_headers.is_empty());
        assert_eq!(e.letter.header.size as usize, e.letter.body.len());
        assert_eq!(e.letter.header.checksum, checksum_body(&e.letter.body));

        let (pairs, consumed) = decode_dynamic_headers(&e.letter.body).unwrap();
        assert_eq!(pairs, vec![("fault".to_string(), "error".to_string())]);
        assert_eq!(&e.letter.body[consumed..], b"payload");
    }

    #[test]
    fn test_double_seal_does_not_duplicate_bag() {
        let mut e = Envelope::new(Bytes::from_static(b"payload"));
        e.add_dynamic_header("k", "v");
        e.seal();
        let sealed = e.letter.body.clone();
        e.seal();
        assert_eq!(e.letter.body, sealed);
    }
}
