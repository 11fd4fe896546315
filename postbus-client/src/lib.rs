//! # postbus-client
//!
//! The postbus RPC client.
//!
//! This crate provides:
//! - A multiplexing client: many concurrent requests share one connection,
//!   correlated by session id, responses resolved out of order
//! - Explicit stop with a bounded grace period
//! - A reconnect wrapper with jittered exponential backoff
//! - Optional per-request latency metrics
//! - Optional TLS via an opaque credentials object

pub mod client;
pub mod error;
pub mod hist;
pub mod reconnect;
pub mod stream;
pub mod tls;

pub use client::{Client, ClientConfig, PendingReply};
pub use error::ClientError;
pub use hist::LatencyHistogram;
pub use reconnect::{ReconnectBackoff, ReconnectClient};
pub use stream::ClientStream;
pub use tls::ClientCredentials;
