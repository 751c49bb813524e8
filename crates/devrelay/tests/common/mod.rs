#![allow(dead_code)]

use devrelay::config::ServerConfig;
use devrelay::liveness::LivenessMonitor;
use devrelay::server::ServerState;
use devrelay_common::{ClientMessage, Role, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub const TOKEN: &str = "test-secret";

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        health_addr: "127.0.0.1:0".parse().unwrap(),
        token: TOKEN.to_string(),
        max_conns: 1000,
        max_payload: 65_536,
        auth_timeout: 5,
    }
}

type ClientStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<ClientStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<ClientStream>,
}

impl TestClient {
    /// Open a WebSocket without authenticating.
    pub async fn connect(addr: &SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    pub async fn device(addr: &SocketAddr, device_id: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&ClientMessage::auth_device(TOKEN, device_id)).await;
        let ack = client.recv().await;
        assert_eq!(ack, ServerMessage::auth_ok(Role::Device, Some(device_id.to_string())));
        client
    }

    pub async fn controller(addr: &SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&ClientMessage::auth_controller(TOKEN)).await;
        let ack = client.recv().await;
        assert_eq!(ack, ServerMessage::auth_ok(Role::Controller, None));
        client
    }

    pub async fn send(&mut self, msg: &ClientMessage) {
        self.send_text(&msg.encode().unwrap()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> ServerMessage {
        self.recv_timeout(Duration::from_secs(5))
            .await
            .expect("timeout waiting for message")
    }

    /// Next relay message, skipping control frames. `None` on timeout.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ServerMessage> {
        let next = async {
            loop {
                let msg = self
                    .ws_rx
                    .next()
                    .await
                    .expect("connection ended")
                    .expect("websocket error");
                match msg {
                    Message::Text(text) => return ServerMessage::decode(text.as_bytes()).unwrap(),
                    Message::Ping(_) | Message::Pong(_) => {}
                    other => panic!("expected text message, got {other:?}"),
                }
            }
        };
        tokio::time::timeout(timeout, next).await.ok()
    }

    /// Wait for the relay to close the connection, failing on any data message.
    pub async fn expect_closed(&mut self) {
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(msg) = self.ws_rx.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => return,
                    Ok(Message::Ping(_) | Message::Pong(_)) => {}
                    Ok(other) => panic!("expected close, got {other:?}"),
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "connection was not closed");
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn start_server_with(
    configure: impl FnOnce(&mut ServerConfig),
    liveness: LivenessMonitor,
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    configure(&mut config);
    let state = Arc::new(ServerState::with_liveness(config, liveness));

    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = devrelay::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    (addr, state)
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}, LivenessMonitor::new()).await
}
