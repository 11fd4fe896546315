//! The multiplexing RPC client.

use crate::error::ClientError;
use crate::hist::LatencyHistogram;
use crate::stream::ClientStream;
use crate::tls::ClientCredentials;
use postbus_core::limits;
use postbus_core::{
    apply_filters, parse_header, parse_payload, Connection, ConnectionLimits, Filter, Gate,
    GateGuard, ReceiveContext,
};
use postbus_protocol::{Compression, Envelope};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    /// TCP (and TLS) establishment timeout.
    pub connect_timeout: Duration,
    /// Deadline for receiving a response body once its header arrived.
    pub recv_timeout: Duration,
    /// Admission budget for in-flight request bodies.
    pub memory_budget: u64,
    pub basic_request_size: u64,
    pub bloat_factor: f64,
    /// How long [`Client::stop`] waits for outstanding requests before
    /// forcing the connection down.
    pub stop_grace: Duration,
    pub nodelay: bool,
    /// TLS credentials, treated as inert configuration.
    pub credentials: Option<ClientCredentials>,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            connect_timeout: Duration::from_secs(10),
            recv_timeout: limits::DEFAULT_BODY_PARSE_TIMEOUT,
            memory_budget: limits::DEFAULT_MAX_MEMORY,
            basic_request_size: limits::DEFAULT_BASIC_REQUEST_SIZE,
            bloat_factor: limits::DEFAULT_BLOAT_FACTOR,
            stop_grace: Duration::from_secs(1),
            nodelay: true,
            credentials: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_credentials(mut self, credentials: ClientCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn to_limits(&self) -> ConnectionLimits {
        ConnectionLimits::new(
            self.basic_request_size,
            self.bloat_factor,
            self.memory_budget,
            self.recv_timeout,
        )
    }
}

/// A request waiting for its response.
struct WorkItem {
    tx: oneshot::Sender<Result<ReceiveContext, ClientError>>,
    accepted_at: Instant,
}

/// Pending requests keyed by live session id, plus the wrapping allocator.
#[derive(Default)]
struct PendingTable {
    slots: HashMap<u16, WorkItem>,
    next_session: u16,
}

impl PendingTable {
    /// Allocates the next session id, skipping ids that still have a live
    /// request in flight so wraparound can never collide.
    fn alloc(&mut self) -> Result<u16, ClientError> {
        if self.slots.len() > u16::MAX as usize {
            return Err(ClientError::SessionsExhausted);
        }
        loop {
            self.next_session = self.next_session.wrapping_add(1);
            if !self.slots.contains_key(&self.next_session) {
                return Ok(self.next_session);
            }
        }
    }
}

/// The response side of [`Client::send`].
///
/// The write happens in the background; completion and failure are both
/// observed only through this future.
pub struct PendingReply {
    session: u16,
    rx: oneshot::Receiver<Result<ReceiveContext, ClientError>>,
}

impl PendingReply {
    /// The session id this request occupies while in flight.
    pub fn session(&self) -> u16 {
        self.session
    }

    /// Waits for the correlated response.
    pub async fn recv(self) -> Result<ReceiveContext, ClientError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }
}

/// A client owning one connection, multiplexing concurrent requests over
/// it by session id.
pub struct Client {
    config: ClientConfig,
    limits: Arc<ConnectionLimits>,
    conn: parking_lot::Mutex<Option<Arc<Connection<ClientStream>>>>,
    pending: Arc<parking_lot::Mutex<PendingTable>>,
    in_filters: Arc<Vec<Box<dyn Filter<ReceiveContext>>>>,
    out_filters: Arc<Vec<Box<dyn Filter<Envelope>>>>,
    gate: parking_lot::Mutex<Gate>,
    read_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    hist: Arc<parking_lot::Mutex<Option<LatencyHistogram>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let limits = Arc::new(config.to_limits());
        Self {
            config,
            limits,
            conn: parking_lot::Mutex::new(None),
            pending: Arc::new(parking_lot::Mutex::new(PendingTable::default())),
            in_filters: Arc::new(Vec::new()),
            out_filters: Arc::new(Vec::new()),
            gate: parking_lot::Mutex::new(Gate::new()),
            read_task: parking_lot::Mutex::new(None),
            hist: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.config.server_addr
    }

    /// Registers an incoming filter. Ignored with an error log once the
    /// client connected: pipelines are fixed at connect time.
    pub fn add_incoming_filter(&mut self, filter: Box<dyn Filter<ReceiveContext>>) {
        match Arc::get_mut(&mut self.in_filters) {
            Some(filters) => filters.push(filter),
            None => tracing::error!("filter registration after connect is ignored"),
        }
    }

    pub fn add_outgoing_filter(&mut self, filter: Box<dyn Filter<Envelope>>) {
        match Arc::get_mut(&mut self.out_filters) {
            Some(filters) => filters.push(filter),
            None => tracing::error!("filter registration after connect is ignored"),
        }
    }

    pub fn is_conn_valid(&self) -> bool {
        self.conn
            .lock()
            .as_ref()
            .map(|conn| conn.is_valid())
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().slots.len()
    }

    pub fn enable_latency_metrics(&self) {
        let mut hist = self.hist.lock();
        if hist.is_none() {
            *hist = Some(LatencyHistogram::new());
        }
    }

    pub fn disable_latency_metrics(&self) {
        *self.hist.lock() = None;
    }

    /// A copy of the recorded latencies, if metrics are enabled.
    pub fn latency_metrics(&self) -> Option<LatencyHistogram> {
        self.hist.lock().clone()
    }

    fn current_conn(&self) -> Option<Arc<Connection<ClientStream>>> {
        self.conn.lock().clone()
    }

    /// Connects and starts the background read loop.
    ///
    /// Calling connect on a connected client is a programming error, not a
    /// recoverable condition.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_conn_valid() {
            return Err(ClientError::AlreadyConnected);
        }
        let gate = self.gate.lock().clone();
        let guard = gate.enter().ok_or(ClientError::ShuttingDown)?;

        tracing::debug!(addr = %self.config.server_addr, "connecting");
        let tcp = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.server_addr),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)??;
        if self.config.nodelay {
            tcp.set_nodelay(true).ok();
        }
        let stream = match &self.config.credentials {
            Some(credentials) => credentials.connect(tcp).await?,
            None => ClientStream::Plain { stream: tcp },
        };

        let conn = Arc::new(Connection::new(
            stream,
            self.config.server_addr,
            self.limits.clone(),
        ));
        *self.conn.lock() = Some(conn.clone());

        let task = tokio::spawn(Self::read_loop(
            conn,
            self.pending.clone(),
            self.in_filters.clone(),
            self.hist.clone(),
            guard,
        ));
        *self.read_task.lock() = Some(task);
        tracing::debug!("connected");
        Ok(())
    }

    /// Sends one request; the returned [`PendingReply`] resolves with the
    /// response whose session matches, regardless of arrival order.
    pub async fn send(&self, mut envelope: Envelope) -> Result<PendingReply, ClientError> {
        let conn = self.current_conn().ok_or(ClientError::NotConnected)?;
        if !conn.is_valid() {
            return Err(ClientError::ConnectionError(
                conn.error().unwrap_or_else(|| "connection invalid".to_string()),
            ));
        }
        let gate = self.gate.lock().clone();
        let guard = gate.enter().ok_or(ClientError::ShuttingDown)?;

        let (session, rx) = {
            let mut pending = self.pending.lock();
            let session = pending.alloc()?;
            let (tx, rx) = oneshot::channel();
            pending.slots.insert(
                session,
                WorkItem {
                    tx,
                    accepted_at: Instant::now(),
                },
            );
            (session, rx)
        };
        envelope.set_session(session);
        envelope.seal();

        let envelope = match apply_filters(&self.out_filters, Some(envelope)).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                self.pending.lock().slots.remove(&session);
                return Err(ClientError::ConnectionError(
                    "outgoing pipeline dropped the request".to_string(),
                ));
            }
            Err(e) => {
                self.pending.lock().slots.remove(&session);
                return Err(e.into());
            }
        };

        // dispatched concurrently; callers observe completion only via the
        // reply future
        let limits = self.limits.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let permit = match limits.admit(envelope.letter.body.len() as u64).await {
                Ok(permit) => permit,
                Err(e) => {
                    conn.set_error(format!("admission failed: {}", e));
                    Self::fail_outstanding(&conn, &pending);
                    return;
                }
            };
            if let Err(e) = conn.write_envelope(&envelope).await {
                conn.set_error(format!("write failed: {}", e));
                Self::fail_outstanding(&conn, &pending);
            }
            drop(permit);
        });

        Ok(PendingReply { session, rx })
    }

    /// Stops the client: a bounded grace period for outstanding requests,
    /// then a clean output half-close, then forced teardown and drain.
    pub async fn stop(&self) {
        tracing::debug!("stopping client");
        let deadline = Instant::now() + self.config.stop_grace;
        while !self.pending.lock().slots.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if let Some(conn) = self.current_conn() {
            let _ = conn.shutdown_output().await;
            Self::fail_outstanding(&conn, &self.pending);
        }
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        let gate = self.gate.lock().clone();
        gate.close().await;
        tracing::debug!("client stopped");
    }

    /// Tears down the current connection, fails everything pending, and
    /// connects again.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        if let Some(conn) = self.current_conn() {
            Self::fail_outstanding(&conn, &self.pending);
        }
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        let old_gate = self.gate.lock().clone();
        old_gate.close().await;
        // gates cannot reopen; a fresh one tracks the new connection
        *self.gate.lock() = Gate::new();
        *self.conn.lock() = None;
        self.connect().await
    }

    fn fail_outstanding(
        conn: &Arc<Connection<ClientStream>>,
        pending: &Arc<parking_lot::Mutex<PendingTable>>,
    ) {
        conn.force_close();
        let items: Vec<WorkItem> = {
            let mut table = pending.lock();
            table.slots.drain().map(|(_, item)| item).collect()
        };
        if items.is_empty() {
            return;
        }
        let reason = conn
            .error()
            .unwrap_or_else(|| "connection torn down".to_string());
        tracing::info!("failing {} outstanding requests: {}", items.len(), reason);
        for item in items {
            let _ = item
                .tx
                .send(Err(ClientError::ConnectionError(reason.clone())));
        }
    }

    async fn read_loop(
        conn: Arc<Connection<ClientStream>>,
        pending: Arc<parking_lot::Mutex<PendingTable>>,
        in_filters: Arc<Vec<Box<dyn Filter<ReceiveContext>>>>,
        hist: Arc<parking_lot::Mutex<Option<LatencyHistogram>>>,
        guard: GateGuard,
    ) {
        let _guard = guard;
        tracing::debug!("read loop started");
        while conn.is_valid() {
            tokio::select! {
                biased;
                _ = conn.closed() => break,
                again = Self::process_one(&conn, &pending, &in_filters, &hist) => {
                    if !again {
                        break;
                    }
                }
            }
        }
        tracing::debug!("read loop finished");
    }

    /// Reads and resolves one response. Returns false when the loop must
    /// exit.
    async fn process_one(
        conn: &Arc<Connection<ClientStream>>,
        pending: &Arc<parking_lot::Mutex<PendingTable>>,
        in_filters: &[Box<dyn Filter<ReceiveContext>>],
        hist: &Arc<parking_lot::Mutex<Option<LatencyHistogram>>>,
    ) -> bool {
        let header = match parse_header(conn).await {
            Ok(header) => header,
            Err(e) => {
                if pending.lock().slots.is_empty() {
                    // peer closed between exchanges; the expected quiet path
                    tracing::debug!("server closed the connection: {}", e);
                    conn.disable();
                } else {
                    conn.set_error(format!("failed reading response header: {}", e));
                    Self::fail_outstanding(conn, pending);
                }
                return false;
            }
        };
        let ctx = match parse_payload(conn, header).await {
            Ok(ctx) => ctx,
            Err(e) => {
                conn.set_error(format!("failed reading response body: {}", e));
                Self::fail_outstanding(conn, pending);
                return false;
            }
        };
        let ctx = match apply_filters(in_filters, Some(ctx)).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => return true,
            Err(e) => {
                conn.set_error(format!("incoming filter failed: {}", e));
                Self::fail_outstanding(conn, pending);
                return false;
            }
        };
        if ctx.header.compression != Compression::None {
            conn.set_error(format!(
                "server response is {}-compressed with no matching decompression filter",
                ctx.header.compression
            ));
            Self::fail_outstanding(conn, pending);
            return false;
        }

        let session = ctx.session();
        let item = pending.lock().slots.remove(&session);
        match item {
            Some(item) => {
                if let Some(hist) = hist.lock().as_mut() {
                    hist.record(item.accepted_at.elapsed());
                }
                let _ = item.tx.send(Ok(ctx));
                true
            }
            None => {
                if !conn.is_enabled() {
                    // teardown already drained the table; the late response
                    // has nowhere to go
                    return false;
                }
                debug_assert!(false, "response correlates to no in-flight session {}", session);
                conn.set_error(format!(
                    "response correlates to no in-flight session {}",
                    session
                ));
                Self::fail_outstanding(conn, pending);
                false
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_addr", &self.config.server_addr)
            .field("connected", &self.is_conn_valid())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("127.0.0.1:7411".parse().unwrap());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.recv_timeout, Duration::from_secs(60));
        assert_eq!(config.memory_budget, 1 << 30);
        assert!(config.nodelay);
    }

    #[test]
    fn test_session_allocation_skips_live_ids() {
        let mut table = PendingTable::default();
        let first = table.alloc().unwrap();
        assert_eq!(first, 1);

        // occupy the next id and confirm allocation steps over it
        let (tx, _rx) = oneshot::channel();
        table.slots.insert(
            2,
            WorkItem {
                tx,
                accepted_at: Instant::now(),
            },
        );
        let next = table.alloc().unwrap();
        assert_eq!(next, 3);
    }

    #[test]
    fn test_session_allocation_wraps() {
        let mut table = PendingTable::default();
        table.next_session = u16::MAX - 1;
        assert_eq!(table.alloc().unwrap(), u16::MAX);
        assert_eq!(table.alloc().unwrap(), 0);
        assert_eq!(table.alloc().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_without_connect_fails() {
        let client = Client::new(ClientConfig::new("127.0.0.1:7411".parse().unwrap()));
        let result = client
            .send(Envelope::new(bytes::Bytes::from_static(b"x")))
            .await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_latency_metrics_toggle() {
        let client = Client::new(ClientConfig::new("127.0.0.1:7411".parse().unwrap()));
        assert!(client.latency_metrics().is_none());
        client.enable_latency_metrics();
        assert_eq!(client.latency_metrics().unwrap().count(), 0);
        client.disable_latency_metrics();
        assert!(client.latency_metrics().is_none());
    }
}
