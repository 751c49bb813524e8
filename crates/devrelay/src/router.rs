//! Per-message dispatch for authenticated connections.
//!
//! Dispatch is keyed by the sender's role and the message type. Combinations
//! not listed below are ignored without a reply, so newer clients can send
//! message types this relay does not know yet.
//!
//! | role       | type          | effect                                      |
//! |------------|---------------|---------------------------------------------|
//! | device     | `telemetry`   | fan out to every interested controller      |
//! | controller | `subscribe`   | add to own subscription set, acknowledge    |
//! | controller | `unsubscribe` | remove from own subscription set, acknowledge |
//! | controller | `command`     | forward to one device, acknowledge or error |

use crate::auth::Session;
use crate::connection::{Connection, Delivery};
use crate::metrics::counters;
use crate::registry::Registry;
use devrelay_common::message::non_empty_str;
use devrelay_common::types::{error_message, COMMAND_FORWARDED};
use devrelay_common::{ClientMessage, ServerMessage};
use serde_json::Value;

/// Decode a raw payload and dispatch it. Undecodable input is answered with
/// an `error` message; the connection stays open.
pub fn handle_payload(registry: &Registry, session: &Session, conn: &Connection, data: &[u8]) {
    match ClientMessage::decode(data) {
        Ok(msg) => dispatch(registry, session, conn, msg),
        Err(e) => {
            counters::protocol_errors_total();
            tracing::debug!(conn_id = conn.id(), "undecodable message: {}", e);
            let _ = conn.send(ServerMessage::error(error_message::INVALID_MESSAGE));
        }
    }
}

/// Apply one decoded message from `conn`.
pub fn dispatch(registry: &Registry, session: &Session, conn: &Connection, msg: ClientMessage) {
    match (session, msg) {
        (Session::Device { device_id }, ClientMessage::Telemetry { payload }) => {
            fan_out_telemetry(registry, device_id, &payload);
        }
        (Session::Controller, ClientMessage::Subscribe { device_id }) => {
            if let Some(device_id) = non_empty_str(device_id.as_ref()) {
                registry.subscribe(conn, device_id);
                let _ = conn.send(ServerMessage::Subscribed {
                    device_id: device_id.to_string(),
                });
            }
        }
        (Session::Controller, ClientMessage::Unsubscribe { device_id }) => {
            if let Some(device_id) = non_empty_str(device_id.as_ref()) {
                registry.unsubscribe(conn, device_id);
                let _ = conn.send(ServerMessage::Unsubscribed {
                    device_id: device_id.to_string(),
                });
            }
        }
        (Session::Controller, ClientMessage::Command { device_id, payload }) => {
            let reply = forward_command(registry, device_id.as_ref(), payload);
            let _ = conn.send(reply);
        }
        (session, other) => {
            tracing::debug!(
                conn_id = conn.id(),
                role = %session.role(),
                kind = other.kind(),
                "ignoring message"
            );
        }
    }
}

/// Send telemetry from `device_id` to every controller whose subscription set
/// is empty or names the device. Returns how many controllers it was queued for.
pub fn fan_out_telemetry(registry: &Registry, device_id: &str, payload: &Value) -> usize {
    let mut delivered = 0;
    for controller in registry.all_controllers() {
        if !controller.wants(device_id) {
            continue;
        }
        let msg = ServerMessage::Telemetry {
            device_id: device_id.to_string(),
            payload: payload.clone(),
        };
        match controller.connection().send(msg) {
            Delivery::Queued => delivered += 1,
            Delivery::Full => counters::messages_dropped_total("queue_full"),
            Delivery::Closed => counters::messages_dropped_total("closed"),
        }
    }
    counters::telemetry_delivered_total(delivered as u64);
    delivered
}

/// Forward a command and build the reply for the sending controller.
fn forward_command(registry: &Registry, device_id: Option<&Value>, payload: Option<Value>) -> ServerMessage {
    let Some(device_id) = non_empty_str(device_id) else {
        counters::commands_total("invalid");
        return ServerMessage::error(error_message::COMMAND_REQUIRES_DEVICE_ID);
    };
    let Some(payload) = payload else {
        counters::commands_total("invalid");
        return ServerMessage::error(error_message::COMMAND_REQUIRES_PAYLOAD);
    };

    let delivery = registry
        .lookup_device(device_id)
        .map_or(Delivery::Closed, |device| device.send(ServerMessage::Command { payload }));

    match delivery {
        Delivery::Queued => {
            counters::commands_total("forwarded");
            ServerMessage::ok(COMMAND_FORWARDED)
        }
        Delivery::Full => {
            counters::commands_total("busy");
            ServerMessage::device_error(error_message::DEVICE_BUSY, device_id)
        }
        Delivery::Closed => {
            counters::commands_total("offline");
            ServerMessage::device_error(error_message::DEVICE_NOT_CONNECTED, device_id)
        }
    }
}
