mod common;

use common::*;
use devrelay::liveness::LivenessMonitor;
use devrelay::server::ServerState;
use devrelay_common::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn device_and_controller_are_registered() {
    let (addr, state) = start_server().await;

    let _device = TestClient::device(&addr, "d1").await;
    let _controller = TestClient::controller(&addr).await;

    assert!(state.registry.lookup_device("d1").is_some());
    assert_eq!(state.registry.controller_count(), 1);
}

#[tokio::test]
async fn command_round_trip() {
    let (addr, _state) = start_server().await;

    let mut device = TestClient::device(&addr, "d1").await;
    let mut controller = TestClient::controller(&addr).await;

    controller
        .send(&ClientMessage::command("d1", json!({"op": "open_valve"})))
        .await;

    assert_eq!(
        device.recv().await,
        ServerMessage::Command {
            payload: json!({"op": "open_valve"})
        }
    );
    assert_eq!(controller.recv().await, ServerMessage::ok("command forwarded"));
}

#[tokio::test]
async fn command_to_offline_device_reports_error() {
    let (addr, _state) = start_server().await;

    let mut bystander = TestClient::device(&addr, "d1").await;
    let mut controller = TestClient::controller(&addr).await;

    controller
        .send(&ClientMessage::command("d404", json!("ping")))
        .await;

    assert_eq!(
        controller.recv().await,
        ServerMessage::device_error("device not connected", "d404")
    );
    assert!(bystander
        .recv_timeout(Duration::from_millis(200))
        .await
        .is_none());
}

#[tokio::test]
async fn command_without_payload_is_rejected() {
    let (addr, _state) = start_server().await;

    let mut device = TestClient::device(&addr, "d1").await;
    let mut controller = TestClient::controller(&addr).await;

    controller
        .send_text(r#"{"type":"command","deviceId":"d1"}"#)
        .await;
    assert_eq!(
        controller.recv().await,
        ServerMessage::error("command requires payload")
    );

    controller
        .send_text(r#"{"type":"command","payload":1}"#)
        .await;
    assert_eq!(
        controller.recv().await,
        ServerMessage::error("command requires deviceId")
    );

    assert!(device.recv_timeout(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn telemetry_fans_out_by_subscription() {
    let (addr, _state) = start_server().await;

    let mut d1 = TestClient::device(&addr, "d1").await;
    let mut d2 = TestClient::device(&addr, "d2").await;
    let mut watch_all = TestClient::controller(&addr).await;
    let mut watch_d1 = TestClient::controller(&addr).await;

    watch_d1.send(&ClientMessage::subscribe("d1")).await;
    assert_eq!(
        watch_d1.recv().await,
        ServerMessage::Subscribed {
            device_id: "d1".into()
        }
    );

    d1.send(&ClientMessage::telemetry(json!({"temp": 21}))).await;
    let from_d1 = ServerMessage::Telemetry {
        device_id: "d1".into(),
        payload: json!({"temp": 21}),
    };
    assert_eq!(watch_all.recv().await, from_d1);
    assert_eq!(watch_d1.recv().await, from_d1);

    d2.send(&ClientMessage::telemetry(json!({"temp": 5}))).await;
    assert_eq!(
        watch_all.recv().await,
        ServerMessage::Telemetry {
            device_id: "d2".into(),
            payload: json!({"temp": 5}),
        }
    );
    assert!(watch_d1
        .recv_timeout(Duration::from_millis(200))
        .await
        .is_none());
    assert!(d1.recv_timeout(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn unsubscribe_is_acknowledged_without_prior_subscription() {
    let (addr, _state) = start_server().await;
    let mut controller = TestClient::controller(&addr).await;

    controller.send(&ClientMessage::unsubscribe("d9")).await;
    assert_eq!(
        controller.recv().await,
        ServerMessage::Unsubscribed {
            device_id: "d9".into()
        }
    );
}

#[tokio::test]
async fn unsubscribing_restores_wildcard() {
    let (addr, _state) = start_server().await;

    let mut d2 = TestClient::device(&addr, "d2").await;
    let mut controller = TestClient::controller(&addr).await;

    controller.send(&ClientMessage::subscribe("d1")).await;
    controller.recv().await;
    controller.send(&ClientMessage::unsubscribe("d1")).await;
    controller.recv().await;

    d2.send(&ClientMessage::telemetry(json!(7))).await;
    assert_eq!(
        controller.recv().await,
        ServerMessage::Telemetry {
            device_id: "d2".into(),
            payload: json!(7),
        }
    );
}

#[tokio::test]
async fn bad_token_is_rejected_and_closed() {
    let (addr, state) = start_server().await;

    let mut client = TestClient::connect(&addr).await;
    client
        .send(&ClientMessage::auth_device("wrong", "d1"))
        .await;

    assert_eq!(client.recv().await, ServerMessage::error("invalid token"));
    client.expect_closed().await;
    assert!(state.registry.lookup_device("d1").is_none());
    assert_eq!(state.registry.controller_count(), 0);
}

#[tokio::test]
async fn first_message_must_be_auth() {
    let (addr, state) = start_server().await;

    let mut client = TestClient::connect(&addr).await;
    client.send(&ClientMessage::telemetry(json!(1))).await;

    assert_eq!(
        client.recv().await,
        ServerMessage::error("expected auth message")
    );
    client.expect_closed().await;
    assert_eq!(state.registry.device_count(), 0);
}

#[tokio::test]
async fn handshake_rejections_name_the_failure() {
    let (addr, state) = start_server().await;

    let cases = [
        ("not json at all", "invalid message"),
        (r#"{"type":"auth","role":"admin","token":"test-secret"}"#, "invalid role"),
        (r#"{"type":"auth","role":"device","token":"test-secret"}"#, "deviceId required for device role"),
        (r#"{"type":"auth","role":"device","token":"test-secret","deviceId":""}"#, "deviceId required for device role"),
    ];

    for (payload, reason) in cases {
        let mut client = TestClient::connect(&addr).await;
        client.send_text(payload).await;
        assert_eq!(client.recv().await, ServerMessage::error(reason), "payload {payload}");
        client.expect_closed().await;
    }

    assert_eq!(state.registry.device_count(), 0);
    assert_eq!(state.registry.controller_count(), 0);
}

#[tokio::test]
async fn silent_client_times_out_during_handshake() {
    let (addr, _state) = start_server_with(|c| c.auth_timeout = 1, LivenessMonitor::new()).await;

    let mut client = TestClient::connect(&addr).await;
    assert_eq!(
        client.recv().await,
        ServerMessage::error("authentication timeout")
    );
    client.expect_closed().await;
}

#[tokio::test]
async fn malformed_message_after_auth_keeps_connection() {
    let (addr, _state) = start_server().await;
    let mut controller = TestClient::controller(&addr).await;

    controller.send_text("{definitely not json").await;
    assert_eq!(controller.recv().await, ServerMessage::error("invalid message"));

    controller.send(&ClientMessage::subscribe("d1")).await;
    assert_eq!(
        controller.recv().await,
        ServerMessage::Subscribed {
            device_id: "d1".into()
        }
    );
}

#[tokio::test]
async fn unknown_message_types_are_ignored() {
    let (addr, _state) = start_server().await;
    let mut controller = TestClient::controller(&addr).await;

    controller
        .send_text(r#"{"type":"firmware_manifest","version":3}"#)
        .await;
    controller
        .send(&ClientMessage::auth_controller(TOKEN))
        .await;
    controller.send(&ClientMessage::subscribe("d1")).await;

    assert_eq!(
        controller.recv().await,
        ServerMessage::Subscribed {
            device_id: "d1".into()
        }
    );
}

#[tokio::test]
async fn duplicate_device_replaces_old_connection() {
    let (addr, state) = start_server().await;

    let mut old = TestClient::device(&addr, "d1").await;
    let mut new = TestClient::device(&addr, "d1").await;
    old.expect_closed().await;

    let mut controller = TestClient::controller(&addr).await;
    controller
        .send(&ClientMessage::command("d1", json!("to new")))
        .await;
    assert_eq!(
        new.recv().await,
        ServerMessage::Command {
            payload: json!("to new")
        }
    );
    assert_eq!(controller.recv().await, ServerMessage::ok("command forwarded"));
    assert_eq!(state.registry.device_count(), 1);
}

#[tokio::test]
async fn disconnect_removes_device() {
    let (addr, state) = start_server().await;

    let device = TestClient::device(&addr, "d1").await;
    let mut controller = TestClient::controller(&addr).await;
    drop(device);

    wait_until(|| state.registry.lookup_device("d1").is_none()).await;

    controller
        .send(&ClientMessage::command("d1", json!(1)))
        .await;
    assert_eq!(
        controller.recv().await,
        ServerMessage::device_error("device not connected", "d1")
    );
}

#[tokio::test]
async fn disconnect_removes_controller() {
    let (addr, state) = start_server().await;

    let controller = TestClient::controller(&addr).await;
    assert_eq!(state.registry.controller_count(), 1);
    drop(controller);

    wait_until(|| state.registry.controller_count() == 0).await;
    wait_until(|| state.liveness.is_empty()).await;
}

#[tokio::test]
async fn unresponsive_client_is_evicted() {
    let (addr, state) = start_server_with(
        |_| {},
        LivenessMonitor::with_period(Duration::from_millis(100)),
    )
    .await;

    // Never read again, so the client never answers a ping.
    let _silent = TestClient::device(&addr, "d1").await;

    wait_until(|| state.registry.lookup_device("d1").is_none()).await;
    wait_until(|| state.liveness.is_empty()).await;
}

#[tokio::test]
async fn responsive_client_survives_sweeps() {
    let (addr, state) = start_server_with(
        |_| {},
        LivenessMonitor::with_period(Duration::from_millis(100)),
    )
    .await;

    let mut device = TestClient::device(&addr, "d1").await;
    let conn_id = state.registry.lookup_device("d1").unwrap().id();

    // Reading keeps answering pings for several periods.
    assert!(device
        .recv_timeout(Duration::from_millis(700))
        .await
        .is_none());

    let current = state.registry.lookup_device("d1").expect("device evicted");
    assert_eq!(current.id(), conn_id);
}

#[tokio::test]
async fn stalled_reader_is_evicted_under_telemetry_flood() {
    let (addr, state) = start_server_with(
        |_| {},
        LivenessMonitor::with_period(Duration::from_millis(500)),
    )
    .await;

    // Authenticates, then never reads, so its socket buffers fill up.
    let _stalled = TestClient::controller(&addr).await;

    let TestClient { mut ws_tx, mut ws_rx } = TestClient::device(&addr, "d1").await;
    // Keep reading so the device answers pings.
    let reader = tokio::spawn(async move { while ws_rx.next().await.is_some() {} });

    let chunk = "x".repeat(60_000);
    let frame = ClientMessage::telemetry(json!(chunk)).encode().unwrap();
    for _ in 0..1000 {
        ws_tx.send(Message::Text(frame.clone())).await.unwrap();
    }

    wait_until(|| state.registry.controller_count() == 0).await;
    wait_until(|| state.active_connections.load(Ordering::Acquire) == 1).await;
    assert!(state.registry.lookup_device("d1").is_some());
    reader.abort();
}

#[tokio::test]
async fn max_conns_limits_open_sockets() {
    let (addr, state) = start_server_with(|c| c.max_conns = 1, LivenessMonitor::new()).await;

    let _first = TestClient::controller(&addr).await;
    assert_eq!(state.active_connections.load(Ordering::Acquire), 1);

    let second = tokio_tungstenite::connect_async(format!("ws://{addr}")).await;
    assert!(second.is_err());
}

#[tokio::test]
async fn shutdown_closes_authenticated_clients() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(test_config(addr)));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());

    let server = tokio::spawn(devrelay::run_with_shutdown(
        listener,
        Arc::clone(&state),
        shutdown_rx,
    ));

    let mut device = TestClient::device(&addr, "d1").await;
    let mut controller = TestClient::controller(&addr).await;

    shutdown_tx.send(()).unwrap();

    device.expect_closed().await;
    controller.expect_closed().await;
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server should drain")
        .unwrap()
        .unwrap();
    assert_eq!(state.active_connections.load(Ordering::Acquire), 0);
    assert_eq!(state.registry.device_count(), 0);
}
