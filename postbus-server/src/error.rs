//! Server error types.

use postbus_core::{AdmissionError, FilterError};
use postbus_protocol::{Compression, ProtocolError};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("request body still {0}-compressed after incoming filters")]
    UnmatchedCompression(Compression),

    #[error("outgoing pipeline produced no envelope")]
    EmptyReply,

    #[error("server already started")]
    AlreadyStarted,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}
