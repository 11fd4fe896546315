//! Connection state shared by the server and client runtimes.

use crate::limits::ConnectionLimits;
use postbus_protocol::Envelope;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;

/// A duplex byte stream plus the connection's validity state.
///
/// The input half admits exactly one header/body parse at a time; the
/// in-progress counter turns a violation into a debug assertion rather than
/// interleaved reads. The output half sits behind an async mutex so
/// concurrent writers never interleave the bytes of two messages.
pub struct Connection<S> {
    remote_addr: SocketAddr,
    pub limits: Arc<ConnectionLimits>,
    reader: tokio::sync::Mutex<ReadHalf<S>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    parse_in_flight: AtomicU32,
    enabled: AtomicBool,
    eof: AtomicBool,
    error: parking_lot::Mutex<Option<String>>,
    closed: Notify,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, remote_addr: SocketAddr, limits: Arc<ConnectionLimits>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            remote_addr,
            limits,
            reader: tokio::sync::Mutex::new(read_half),
            writer: tokio::sync::Mutex::new(write_half),
            parse_in_flight: AtomicU32::new(0),
            enabled: AtomicBool::new(true),
            eof: AtomicBool::new(false),
            error: parking_lot::Mutex::new(None),
            closed: Notify::new(),
        }
    }

    /// Writes one envelope: header block, then exactly `size` body bytes.
    ///
    /// Serialized against concurrent writers by the write-half mutex.
    pub async fn write_envelope(&self, envelope: &Envelope) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&envelope.encode_header()).await?;
        writer.write_all(&envelope.letter.body).await?;
        writer.flush().await
    }

    /// Half-closes the output stream.
    pub async fn shutdown_output(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl<S> Connection<S> {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn mark_eof(&self) {
        self.eof.store(true, Ordering::SeqCst);
    }

    pub fn at_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    /// Records an error; earlier errors are kept as history.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut slot = self.error.lock();
        match slot.as_mut() {
            None => *slot = Some(message),
            Some(existing) => {
                existing.push_str(" :: ");
                existing.push_str(&message);
            }
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.is_enabled() && !self.has_error() && !self.at_eof()
    }

    /// Disables the connection and wakes anything waiting on [`closed`].
    ///
    /// The blocked read itself is unblocked by its caller dropping the read
    /// future (the loops select on `closed`).
    pub fn force_close(&self) {
        self.disable();
        self.closed.notify_waiters();
    }

    /// Resolves once the connection has been disabled or force-closed.
    pub async fn closed(&self) {
        loop {
            if !self.is_enabled() {
                return;
            }
            let notified = self.closed.notified();
            tokio::pin!(notified);
            // register before re-checking so a concurrent close cannot slip
            // between the check and the await
            notified.as_mut().enable();
            if !self.is_enabled() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn reader(&self) -> &tokio::sync::Mutex<ReadHalf<S>> {
        &self.reader
    }

    pub(crate) fn begin_parse(&self) -> ParseGuard<'_> {
        let previous = self.parse_in_flight.fetch_add(1, Ordering::SeqCst);
        debug_assert_eq!(
            previous, 0,
            "a second header/body parse started while one was in flight"
        );
        ParseGuard {
            counter: &self.parse_in_flight,
        }
    }
}

/// Decrements the parse-in-progress counter on every exit path.
pub(crate) struct ParseGuard<'a> {
    counter: &'a AtomicU32,
}

impl Drop for ParseGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("enabled", &self.is_enabled())
            .field("eof", &self.at_eof())
            .field("error", &self.error())
            .finish()
    }
}
