//! Two-phase receive parsing: fixed-size header, then deadline-bounded body.

use crate::connection::Connection;
use bytes::{Bytes, BytesMut};
use postbus_protocol::letter::decode_dynamic_headers;
use postbus_protocol::{checksum_body, Header, ProtocolError, HEADER_SIZE, MAX_BODY_SIZE};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// A fully parsed, checksum-validated inbound message.
#[derive(Debug)]
pub struct ReceiveContext {
    pub remote_addr: SocketAddr,
    pub header: Header,
    pub body: Bytes,
}

impl ReceiveContext {
    pub fn new(remote_addr: SocketAddr, header: Header, body: Bytes) -> Self {
        debug_assert_eq!(header.size as usize, body.len());
        Self {
            remote_addr,
            header,
            body,
        }
    }

    /// The routing key, used by the server side to pick the handler.
    pub fn request_id(&self) -> u32 {
        self.header.meta
    }

    /// The HTTP-style status code, used by the client side.
    pub fn status(&self) -> u32 {
        self.header.meta
    }

    pub fn session(&self) -> u16 {
        self.header.session
    }

    /// Parses the dynamic-header bag, lazily and only when the bitflag is
    /// set. Call after decompression.
    pub fn dynamic_headers(&self) -> Result<Vec<(String, String)>, ProtocolError> {
        if !self.header.flags.has_dynamic_headers() {
            return Ok(Vec::new());
        }
        decode_dynamic_headers(&self.body).map(|(pairs, _)| pairs)
    }

    /// The payload proper: the body minus any dynamic-header bag, shared
    /// without copying.
    pub fn payload(&self) -> Result<Bytes, ProtocolError> {
        if !self.header.flags.has_dynamic_headers() {
            return Ok(self.body.clone());
        }
        let (_, consumed) = decode_dynamic_headers(&self.body)?;
        Ok(self.body.slice(consumed..))
    }
}

/// Reads up to `n` bytes, stopping early only at end of stream.
async fn read_full<R>(reader: &mut R, n: usize) -> std::io::Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(n);
    buf.resize(n, 0);
    let mut filled = 0;
    while filled < n {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Phase one: reads exactly [`HEADER_SIZE`] bytes and validates the header.
///
/// A clean zero-length read is [`ProtocolError::ConnectionClosed`]; whether
/// that is an error is the caller's policy. A `size` of zero never leads to
/// a body read.
pub async fn parse_header<S>(conn: &Connection<S>) -> Result<Header, ProtocolError>
where
    S: AsyncRead + AsyncWrite,
{
    let _guard = conn.begin_parse();
    let buf = {
        let mut reader = conn.reader().lock().await;
        read_full(&mut *reader, HEADER_SIZE).await?
    };
    if buf.is_empty() {
        conn.mark_eof();
        return Err(ProtocolError::ConnectionClosed);
    }
    if buf.len() < HEADER_SIZE {
        conn.mark_eof();
        return Err(ProtocolError::BadHeader {
            got: buf.len(),
            expected: HEADER_SIZE,
        });
    }
    let header = Header::decode(&buf)?;
    if header.size == 0 {
        return Err(ProtocolError::EmptyBody);
    }
    if header.size > MAX_BODY_SIZE {
        return Err(ProtocolError::TooLarge {
            size: header.size,
            max: MAX_BODY_SIZE,
        });
    }
    Ok(header)
}

/// Phase two: reads exactly `header.size` body bytes under the connection's
/// body-parse deadline and validates length and checksum.
///
/// On deadline expiry the connection is marked failed and force-closed; on
/// a validation failure the body is discarded and closing is left to the
/// caller's policy.
pub async fn parse_payload<S>(
    conn: &Connection<S>,
    header: Header,
) -> Result<ReceiveContext, ProtocolError>
where
    S: AsyncRead + AsyncWrite,
{
    let _guard = conn.begin_parse();
    let deadline = conn.limits.max_body_parse_duration;
    let buf = {
        let mut reader = conn.reader().lock().await;
        match tokio::time::timeout(deadline, read_full(&mut *reader, header.size as usize)).await {
            Ok(read) => read?,
            Err(_) => {
                drop(reader);
                conn.set_error(format!(
                    "body of {} bytes not received within {}ms",
                    header.size,
                    deadline.as_millis()
                ));
                conn.force_close();
                return Err(ProtocolError::BodyTimeout);
            }
        }
    };
    if buf.len() != header.size as usize {
        conn.mark_eof();
        return Err(ProtocolError::SizeMismatch {
            expected: header.size,
            got: buf.len(),
        });
    }
    let actual = checksum_body(&buf);
    if actual != header.checksum {
        return Err(ProtocolError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }
    Ok(ReceiveContext::new(
        conn.remote_addr(),
        header,
        buf.freeze(),
    ))
}
