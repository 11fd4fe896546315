//! Client error types.

use postbus_core::{AdmissionError, FilterError};
use postbus_protocol::ProtocolError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("not connected")]
    NotConnected,

    #[error("already connected; connect called twice")]
    AlreadyConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection failed: {0}")]
    ConnectionError(String),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("all 65536 session ids are in flight")]
    SessionsExhausted,

    #[error("client shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether retrying the operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectTimeout
                | ClientError::ConnectionClosed
                | ClientError::ConnectionError(_)
        )
    }
}
