use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::liveness::LivenessMonitor;
use crate::registry::Registry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Shared state for the relay server.
#[derive(Debug)]
pub struct ServerState {
    /// Device map and controller set.
    pub registry: Registry,
    /// Probe-and-evict bookkeeping for authenticated connections.
    pub liveness: Arc<LivenessMonitor>,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Open sockets, authenticated or not.
    pub active_connections: AtomicUsize,
}

impl ServerState {
    /// State with an empty registry and the standard liveness period.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_liveness(config, LivenessMonitor::new())
    }

    /// State with a caller-supplied liveness monitor.
    #[must_use]
    pub fn with_liveness(config: ServerConfig, liveness: LivenessMonitor) -> Self {
        Self {
            registry: Registry::new(),
            liveness: Arc::new(liveness),
            config,
            active_connections: AtomicUsize::new(0),
        }
    }
}

/// Keeps `active_connections` accurate for the lifetime of one socket task.
struct ConnGuard {
    state: Arc<ServerState>,
    tracker: Arc<Notify>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
        self.tracker.notify_one();
    }
}

/// Run the relay until the process exits.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop and the liveness monitor until `shutdown_rx` sees a
/// new value or its sender is dropped.
///
/// On shutdown the relay stops accepting, terminates every authenticated
/// connection and waits up to 30 seconds for connection tasks to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr().map_err(RelayError::Io)?;
    info!("relay listening on {}", local_addr);
    let task_tracker = Arc::new(Notify::new());
    let monitor = Arc::clone(&state.liveness).spawn();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        if state.active_connections.load(Ordering::Acquire) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", peer);
                            drop(stream);
                            continue;
                        }
                        state.active_connections.fetch_add(1, Ordering::AcqRel);
                        let guard = ConnGuard {
                            state: Arc::clone(&state),
                            tracker: Arc::clone(&task_tracker),
                        };
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let _guard = guard;
                            if let Err(e) = handle_connection(stream, peer, state).await {
                                tracing::debug!("connection from {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!(
                    "shutdown signal received, draining {} connections",
                    state.active_connections.load(Ordering::Acquire)
                );
                break;
            }
        }
    }

    monitor.abort();
    state.liveness.terminate_all();

    let drain_timeout = std::time::Duration::from_secs(30);
    let deadline = tokio::time::Instant::now() + drain_timeout;
    loop {
        let remaining = state.active_connections.load(Ordering::Acquire);
        if remaining == 0 {
            break;
        }
        if tokio::time::timeout_at(deadline, task_tracker.notified())
            .await
            .is_err()
        {
            warn!("drain timeout reached with {} connections still active", remaining);
            break;
        }
    }

    info!("relay shut down gracefully");
    Ok(())
}
