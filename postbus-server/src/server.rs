//! The RPC server: accept loop, per-connection sessions, dispatch, drain.

use crate::config::{CompressionChoice, Config, FilterSettings};
use crate::error::ServerError;
use crate::router::{Router, Service};
use crate::stats::ServerStats;
use crate::stream::ServerStream;
use crate::tls::ServerCredentials;
use bytes::Bytes;
use postbus_core::{
    apply_filters, parse_header, parse_payload, AdmissionError, AdmissionPermit,
    CompressionFilter, Connection, ConnectionLimits, DecompressionFilter, Filter, Gate, GateGuard,
    ReceiveContext,
};
use postbus_protocol::{
    Compression, Envelope, Lz4Codec, ProtocolError, ZstdCodec, HEADER_SIZE, STATUS_BAD_REQUEST,
    STATUS_NOT_IMPLEMENTED, STATUS_OK,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
    /// Admission and body-deadline limits shared by every connection.
    pub limits: Arc<ConnectionLimits>,
    /// TLS credentials, treated as inert configuration.
    pub credentials: Option<ServerCredentials>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", crate::config::DEFAULT_PORT)
                .parse()
                .unwrap(),
            nodelay: true,
            limits: Arc::new(ConnectionLimits::default()),
            credentials: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = Arc::new(limits);
        self
    }

    pub fn with_credentials(mut self, credentials: ServerCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Builds a runtime configuration from the file-backed [`Config`].
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let bind_addr: SocketAddr = config
            .network
            .bind_addr
            .parse()
            .map_err(|e| ServerError::Config(format!("bad bind_addr: {}", e)))?;
        config.tls.validate()?;
        let credentials = match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert), Some(key)) if config.tls.enabled => {
                Some(match &config.tls.client_ca_path {
                    Some(ca) => ServerCredentials::from_pem_with_client_auth(cert, key, ca)?,
                    None => ServerCredentials::from_pem(cert, key)?,
                })
            }
            _ => None,
        };
        Ok(Self {
            bind_addr,
            nodelay: config.network.nodelay,
            limits: Arc::new(config.limits.to_limits()),
            credentials,
        })
    }
}

/// State shared between the accept loop, connection tasks, and dispatches.
struct Shared {
    config: ServerConfig,
    router: Router,
    in_filters: Vec<Box<dyn Filter<ReceiveContext>>>,
    out_filters: Vec<Box<dyn Filter<Envelope>>>,
    stats: ServerStats,
    gate: Gate,
    connections: parking_lot::Mutex<HashMap<u64, Arc<Connection<ServerStream>>>>,
    connection_seq: AtomicU64,
}

enum DispatchOutcome {
    Completed,
    BadRequestId,
    NoRoute,
}

/// The postbus RPC server.
///
/// Services and filters are registered before [`Server::start`] and frozen
/// afterwards. [`Server::stop`] stops accepting, closes the read side of
/// every open connection, then drains in-flight dispatches.
pub struct Server {
    shared: Arc<Shared>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                router: Router::new(),
                in_filters: Vec::new(),
                out_filters: Vec::new(),
                stats: ServerStats::default(),
                gate: Gate::new(),
                connections: parking_lot::Mutex::new(HashMap::new()),
                connection_seq: AtomicU64::new(0),
            }),
            accept_task: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Registers a service. Ignored with an error log once started: the
    /// registry is immutable after start.
    pub fn register_service(&mut self, service: Box<dyn Service>) {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.router.register(service),
            None => tracing::error!("service registration after start is ignored"),
        }
    }

    pub fn add_incoming_filter(&mut self, filter: Box<dyn Filter<ReceiveContext>>) {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.in_filters.push(filter),
            None => tracing::error!("filter registration after start is ignored"),
        }
    }

    pub fn add_outgoing_filter(&mut self, filter: Box<dyn Filter<Envelope>>) {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.out_filters.push(filter),
            None => tracing::error!("filter registration after start is ignored"),
        }
    }

    /// Wires the compression filter pair described by [`FilterSettings`].
    pub fn apply_filter_settings(&mut self, settings: &FilterSettings) {
        match settings.compression {
            CompressionChoice::None => {}
            CompressionChoice::Lz4 => {
                self.add_incoming_filter(Box::new(DecompressionFilter::new(Lz4Codec)));
                self.add_outgoing_filter(Box::new(CompressionFilter::new(
                    Lz4Codec,
                    settings.min_compression_size,
                )));
            }
            CompressionChoice::Zstd => {
                self.add_incoming_filter(Box::new(DecompressionFilter::new(ZstdCodec::default())));
                self.add_outgoing_filter(Box::new(CompressionFilter::new(
                    ZstdCodec::default(),
                    settings.min_compression_size,
                )));
            }
        }
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.accept_task.lock().is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        tracing::info!(
            addr = %local_addr,
            tls = self.shared.config.credentials.is_some(),
            limits = %self.shared.config.limits,
            "server listening"
        );

        let shared = self.shared.clone();
        let task = tokio::spawn(Self::accept_loop(listener, shared));
        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    /// The bound address, available after [`Server::start`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    pub fn limits(&self) -> &ConnectionLimits {
        &self.shared.config.limits
    }

    pub fn is_running(&self) -> bool {
        self.accept_task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Graceful shutdown: abort future accepts, close the read side of
    /// every open connection, then wait for in-flight dispatches to drain.
    ///
    /// The ordering matters: requests already admitted still get their
    /// responses written before the gate closes.
    pub async fn stop(&self) {
        tracing::info!("stopping server: aborting accepts");
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let connections: Vec<_> = self.shared.connections.lock().values().cloned().collect();
        tracing::info!("closing {} open connections", connections.len());
        for conn in connections {
            conn.force_close();
        }
        self.shared.gate.close().await;
        tracing::info!("dispatch gate drained; server stopped");
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if shared.config.nodelay {
                        stream.set_nodelay(true).ok();
                    }
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(stream, addr, shared).await;
                    });
                }
                Err(e) => {
                    // stop() aborts this task before the listener dies, so
                    // an accept failure here is a real fault
                    tracing::error!("accept failed, halting accept loop: {}", e);
                    break;
                }
            }
        }
    }

    async fn handle_connection(tcp: TcpStream, addr: SocketAddr, shared: Arc<Shared>) {
        let stream = match &shared.config.credentials {
            Some(credentials) => match credentials.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(%addr, "TLS handshake failed: {}", e);
                    return;
                }
            },
            None => ServerStream::Plain { stream: tcp },
        };

        let id = shared.connection_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(Connection::new(
            stream,
            addr,
            shared.config.limits.clone(),
        ));
        shared.connections.lock().insert(id, conn.clone());
        ServerStats::bump(&shared.stats.total_connections);
        ServerStats::bump(&shared.stats.active_connections);
        tracing::info!(%addr, id, "client connected");

        while conn.is_valid() {
            tokio::select! {
                biased;
                _ = conn.closed() => break,
                _ = Self::serve_one(&conn, &shared) => {}
            }
        }

        shared.connections.lock().remove(&id);
        shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        match conn.error() {
            Some(error) => tracing::warn!(%addr, id, "connection closed with error: {}", error),
            None => tracing::info!(%addr, id, "client disconnected"),
        }
    }

    /// One read cycle: header, admission, body, then background dispatch.
    ///
    /// The body read must directly follow the header read on this
    /// connection; only the dispatch runs concurrently with the next cycle.
    async fn serve_one(conn: &Arc<Connection<ServerStream>>, shared: &Arc<Shared>) {
        let header = match parse_header(conn).await {
            Ok(header) => header,
            Err(ProtocolError::ConnectionClosed) => {
                conn.disable();
                return;
            }
            Err(e @ ProtocolError::TooLarge { .. }) => {
                ServerStats::bump(&shared.stats.too_large_requests);
                conn.set_error(e.to_string());
                return;
            }
            Err(e) => {
                ServerStats::bump(&shared.stats.bad_requests);
                conn.set_error(format!("header parse failed: {}", e));
                return;
            }
        };

        // backpressure point: suspends this connection's read loop until
        // enough budget is free
        let permit = match shared.config.limits.admit(header.size as u64).await {
            Ok(permit) => permit,
            Err(e @ AdmissionError::RequestTooLarge { .. }) => {
                ServerStats::bump(&shared.stats.too_large_requests);
                conn.set_error(e.to_string());
                return;
            }
            Err(AdmissionError::Closed) => {
                conn.disable();
                return;
            }
        };

        let ctx = match parse_payload(conn, header).await {
            Ok(ctx) => ctx,
            Err(e) => {
                ServerStats::bump(&shared.stats.bad_requests);
                conn.set_error(format!("body parse failed: {}", e));
                return;
            }
        };

        match shared.gate.enter() {
            Some(guard) => {
                let conn = conn.clone();
                let shared = shared.clone();
                tokio::spawn(Self::dispatch(conn, ctx, permit, guard, shared));
            }
            None => {
                tracing::info!("cannot dispatch request, server is shutting down");
                conn.disable();
            }
        }
    }

    async fn dispatch(
        conn: Arc<Connection<ServerStream>>,
        ctx: ReceiveContext,
        permit: AdmissionPermit,
        guard: GateGuard,
        shared: Arc<Shared>,
    ) {
        match Self::dispatch_inner(&conn, ctx, &shared).await {
            Ok(DispatchOutcome::Completed) => {
                ServerStats::bump(&shared.stats.completed_requests);
            }
            Ok(DispatchOutcome::BadRequestId) => {
                ServerStats::bump(&shared.stats.bad_requests);
            }
            Ok(DispatchOutcome::NoRoute) => {
                ServerStats::bump(&shared.stats.no_route_requests);
            }
            Err(e) => {
                ServerStats::bump(&shared.stats.bad_requests);
                conn.set_error(e.to_string());
                tracing::error!(addr = %conn.remote_addr(), "request failed: {}", e);
                let _ = conn.shutdown_output().await;
                conn.force_close();
            }
        }
        // admission credit and drain tracking release here, after the full
        // read-filter-handle-write chain, on every path
        drop(permit);
        drop(guard);
    }

    async fn dispatch_inner(
        conn: &Arc<Connection<ServerStream>>,
        ctx: ReceiveContext,
        shared: &Arc<Shared>,
    ) -> Result<DispatchOutcome, ServerError> {
        let session = ctx.session();
        if ctx.request_id() == 0 {
            Self::reply_error(conn, session, STATUS_BAD_REQUEST, "missing request id").await?;
            return Ok(DispatchOutcome::BadRequestId);
        }
        let request_id = ctx.request_id();
        if shared.router.handle_for(request_id).is_none() {
            Self::reply_error(conn, session, STATUS_NOT_IMPLEMENTED, "no route for request")
                .await?;
            return Ok(DispatchOutcome::NoRoute);
        }
        ServerStats::add(
            &shared.stats.in_bytes,
            (HEADER_SIZE + ctx.body.len()) as u64,
        );

        let ctx = match apply_filters(&shared.in_filters, Some(ctx)).await? {
            Some(ctx) => ctx,
            None => {
                tracing::warn!("request invalidated upstream of the handler; dropping");
                return Ok(DispatchOutcome::Completed);
            }
        };
        if ctx.header.compression != Compression::None {
            return Err(ServerError::UnmatchedCompression(ctx.header.compression));
        }

        // rechecked after filters only to borrow the method; filters cannot
        // rewrite meta routing
        let method = shared
            .router
            .handle_for(request_id)
            .ok_or(ServerError::EmptyReply)?;
        let mut reply = method.invoke(ctx).await?;

        reply.set_session(session);
        if reply.letter.header.meta == 0 {
            reply.set_status(STATUS_OK);
        }
        reply.seal();

        let reply = apply_filters(&shared.out_filters, Some(reply))
            .await?
            .ok_or(ServerError::EmptyReply)?;
        ServerStats::add(&shared.stats.out_bytes, reply.size() as u64);
        conn.write_envelope(&reply).await?;
        Ok(DispatchOutcome::Completed)
    }

    /// Per-message rejection: the connection stays open, the caller gets a
    /// status-coded reply with a short diagnostic body.
    async fn reply_error(
        conn: &Arc<Connection<ServerStream>>,
        session: u16,
        status: u32,
        message: &str,
    ) -> Result<(), ServerError> {
        let mut reply = Envelope::new(Bytes::copy_from_slice(message.as_bytes()));
        reply.set_status(status);
        reply.set_session(session);
        reply.seal();
        conn.write_envelope(&reply).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_addr", &self.shared.config.bind_addr)
            .field("tls", &self.shared.config.credentials.is_some())
            .field("router", &self.shared.router)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::HashService;

    fn echo() -> HashService {
        HashService::new("echo").method("say", |ctx: ReceiveContext| async move {
            Ok(Envelope::new(ctx.body.clone()))
        })
    }

    #[tokio::test]
    async fn test_start_binds_and_stop_drains() {
        let mut server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        server.register_service(Box::new(echo()));
        assert!(!server.is_running());

        server.start().await.unwrap();
        assert!(server.is_running());
        assert!(server.local_addr().unwrap().port() != 0);

        server.stop().await;
        assert_eq!(ServerStats::get(&server.stats().active_connections), 0);
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyStarted)
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_registration_after_start_is_ignored() {
        let mut server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        server.start().await.unwrap();
        // the accept loop holds a clone; registration must not take effect
        server.register_service(Box::new(echo()));
        assert!(server.shared.router.is_empty());
        server.stop().await;
    }
}
