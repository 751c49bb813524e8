use crate::auth::{admit, Session};
use crate::error::RelayError;
use crate::metrics::{counters, gauges, histograms};
use crate::router;
use crate::server::ServerState;
use devrelay_common::types::error_message;
use devrelay_common::ServerMessage;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Process-unique connection identifier.
pub type ConnId = u64;

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// How long a closing connection may spend flushing its Close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Result of a non-blocking send to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the connection's writer.
    Queued,
    /// Dropped because the outbound queue is full.
    Full,
    /// Dropped because the connection is closing or closed.
    Closed,
}

/// Handle to one authenticated socket.
///
/// Owned jointly by the connection's own task, the registry and the liveness
/// monitor. Everything except the connection task talks to the socket through
/// the bounded outbound queue, never directly. Pings bypass the queue so a
/// backlog of messages cannot delay or swallow them.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    tx: mpsc::Sender<ServerMessage>,
    alive: AtomicBool,
    ping_pending: AtomicBool,
    ping: Notify,
    terminated: AtomicBool,
    kill: Notify,
}

impl Connection {
    /// Create a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(peer: SocketAddr) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let conn = Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            tx,
            alive: AtomicBool::new(true),
            ping_pending: AtomicBool::new(false),
            ping: Notify::new(),
            terminated: AtomicBool::new(false),
            kill: Notify::new(),
        };
        (Arc::new(conn), rx)
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Remote address of the socket.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a message without waiting. Failures are reported, never raised.
    pub fn send(&self, msg: ServerMessage) -> Delivery {
        if !self.is_open() {
            return Delivery::Closed;
        }
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Run one liveness cycle: returns `false` if the connection missed the
    /// previous probe (or is already gone) and should be evicted, otherwise
    /// clears the flag and asks the writer for a Ping.
    pub fn probe(&self) -> bool {
        if !self.is_open() || !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.ping_pending.store(true, Ordering::Release);
        self.ping.notify_one();
        true
    }

    /// Claim the pending Ping request, if any.
    pub fn take_ping(&self) -> bool {
        self.ping_pending.swap(false, Ordering::AcqRel)
    }

    /// Resolves when a Ping may be pending.
    pub async fn ping_requested(&self) {
        self.ping.notified().await;
    }

    /// Record a probe acknowledgment.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Whether the connection answered since the last probe.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Ask the connection task to close the socket. Idempotent.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.kill.notify_one();
        }
    }

    /// `false` once [`terminate`](Self::terminate) has been called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.terminated.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been terminated.
    pub async fn terminated(&self) {
        if !self.is_open() {
            return;
        }
        self.kill.notified().await;
    }
}

async fn send_error(ws_tx: &mut WsSink, message: &str) {
    match ServerMessage::error(message).encode() {
        Ok(text) => {
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                tracing::debug!("failed to send error reply: {}", e);
            }
        }
        Err(e) => tracing::warn!("failed to encode error reply: {}", e),
    }
}

/// Run the auth gate on a fresh socket. Rejections are answered with an
/// `error` message followed by a Close frame.
async fn perform_auth(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    state: &ServerState,
    peer: SocketAddr,
) -> Result<Session, RelayError> {
    let err = match timeout(
        Duration::from_secs(state.config.auth_timeout),
        admit(ws_rx, &state.config.token),
    )
    .await
    {
        Ok(Ok(session)) => {
            counters::auth_total("accepted");
            return Ok(session);
        }
        Ok(Err(RelayError::Auth(e))) => {
            counters::auth_total(e.label());
            tracing::debug!(peer = %peer, reason = e.label(), "rejected handshake");
            let _ = timeout(CLOSE_TIMEOUT, send_error(ws_tx, &e.to_string())).await;
            RelayError::Auth(e)
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            counters::auth_total("timeout");
            tracing::debug!(peer = %peer, "handshake timed out");
            let _ = timeout(CLOSE_TIMEOUT, send_error(ws_tx, error_message::AUTH_TIMEOUT)).await;
            RelayError::AuthTimeout
        }
    };
    let _ = timeout(CLOSE_TIMEOUT, ws_tx.send(Message::Close(None))).await;
    Err(err)
}

/// Write one frame, giving up as soon as the connection is terminated.
/// Returns `false` if termination won.
async fn write(ws_tx: &mut WsSink, conn: &Connection, msg: Message) -> Result<bool, RelayError> {
    tokio::select! {
        result = ws_tx.send(msg) => {
            result?;
            Ok(true)
        }
        () = conn.terminated() => Ok(false),
    }
}

/// Drive the select loop of an authenticated connection until the peer
/// closes, the transport fails or the connection is terminated.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    outbound_rx: &mut mpsc::Receiver<ServerMessage>,
    state: &ServerState,
    session: &Session,
    conn: &Connection,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        router::handle_payload(&state.registry, session, conn, text.as_bytes());
                        histograms::dispatch_seconds(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        router::handle_payload(&state.registry, session, conn, &data);
                        histograms::dispatch_seconds(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Pong(_))) => conn.mark_alive(),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(msg) = outbound_rx.recv() => {
                if !write(ws_tx, conn, Message::Text(msg.encode()?)).await? {
                    return Ok(());
                }
            }
            () = conn.ping_requested() => {
                if conn.take_ping() {
                    match write(ws_tx, conn, Message::Ping(Vec::new())).await {
                        Ok(true) => {}
                        Ok(false) => return Ok(()),
                        Err(e) => tracing::debug!("failed to send ping: {}", e),
                    }
                }
            }
            () = conn.terminated() => {
                tracing::debug!(conn_id = conn.id(), "connection terminated by relay");
                return Ok(());
            }
        }
    }
}

/// Serve one accepted TCP stream from WebSocket upgrade to cleanup.
///
/// # Errors
///
/// Returns the reason the connection ended abnormally. The caller only logs it.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), RelayError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_payload),
        max_frame_size: Some(state.config.max_payload),
        ..WebSocketConfig::default()
    };

    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
        .await
        .map_err(RelayError::WebSocket)?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let session = perform_auth(&mut ws_tx, &mut ws_rx, &state, peer).await?;

    let (conn, mut outbound_rx) = Connection::new(peer);

    // The ack is queued before registration so it precedes any routed traffic.
    let _ = conn.send(ServerMessage::auth_ok(
        session.role(),
        session.device_id().map(str::to_string),
    ));
    match &session {
        Session::Device { device_id } => state.registry.register_device(device_id, Arc::clone(&conn)),
        Session::Controller => state.registry.register_controller(Arc::clone(&conn)),
    }
    state.liveness.track(Arc::clone(&conn));
    gauges::inc_connected(session.role());

    tracing::info!(
        role = %session.role(),
        device_id = session.device_id(),
        peer = %peer,
        conn_id = conn.id(),
        "client connected"
    );

    let result = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut outbound_rx,
        &state,
        &session,
        &conn,
    )
    .await;

    conn.terminate();
    state.liveness.untrack(conn.id());
    match &session {
        Session::Device { device_id } => {
            state.registry.remove_device(device_id, &conn);
        }
        Session::Controller => {
            state.registry.remove_controller(&conn);
        }
    }
    gauges::dec_connected(session.role());

    tracing::info!(
        role = %session.role(),
        device_id = session.device_id(),
        conn_id = conn.id(),
        "client disconnected"
    );

    let _ = timeout(CLOSE_TIMEOUT, ws_tx.close()).await;
    result
}
