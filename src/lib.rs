//! # postbus
//!
//! A memory-bounded binary RPC runtime: a 16-byte wire header with
//! checksums and compression flags, a multiplexing client, a server with
//! admission-controlled dispatch, and an ordered async filter pipeline.
//!
//! This crate is the facade: it re-exports the workspace members.
//!
//! ```no_run
//! use postbus::server::{HashService, Server, ServerConfig};
//! use postbus::client::{Client, ClientConfig};
//! use postbus::protocol::Envelope;
//! use bytes::Bytes;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let echo = HashService::new("echo").method("say", |ctx: postbus::core::ReceiveContext| {
//!     async move { Ok(Envelope::new(ctx.body.clone())) }
//! });
//! let request_id = echo.request_id("say");
//!
//! let mut server = Server::new(ServerConfig::new("127.0.0.1:0".parse()?));
//! server.register_service(Box::new(echo));
//! server.start().await?;
//!
//! let client = Client::new(ClientConfig::new(server.local_addr().unwrap()));
//! client.connect().await?;
//!
//! let mut request = Envelope::new(Bytes::from_static(b"hello"));
//! request.set_request_id(request_id);
//! let reply = client.send(request).await?.recv().await?;
//! assert_eq!(&reply.body[..], b"hello");
//! # Ok(())
//! # }
//! ```

pub use postbus_client as client;
pub use postbus_core as core;
pub use postbus_protocol as protocol;
pub use postbus_server as server;
