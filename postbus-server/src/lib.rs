//! # postbus-server
//!
//! The postbus RPC server.
//!
//! This crate provides:
//! - The accept loop and per-connection read/dispatch state machine
//! - Service registration and request routing by `service_id ^ method_id`
//! - Memory-bounded admission around every body parse
//! - Structured server counters
//! - Graceful drain: stop accepting, stop reading, drain dispatch
//! - Optional TLS via an opaque credentials object

pub mod config;
pub mod error;
pub mod router;
pub mod server;
pub mod stats;
pub mod stream;
pub mod tls;

pub use config::{Config, FilterSettings, LimitsSettings, NetworkSettings, TlsSettings};
pub use error::ServerError;
pub use router::{method_id, routing_key, HashService, Method, Router, Service};
pub use server::{Server, ServerConfig};
pub use stats::ServerStats;
pub use stream::ServerStream;
pub use tls::ServerCredentials;
