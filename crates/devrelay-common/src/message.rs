//! JSON message envelopes exchanged over the relay WebSocket.
//!
//! Every message is a JSON object tagged by a string `type` field. Inbound
//! fields stay loosely typed (`serde_json::Value`) so that a wrong field type
//! is answered by the relay's own validation rules instead of failing the
//! whole decode.

use crate::types::{DeviceId, Role, AUTH_OK};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The payload was not a JSON object carrying a string `type`.
#[derive(Debug, Error)]
#[error("malformed message: {0}")]
pub struct ProtocolError(#[from] serde_json::Error);

/// Message sent by a device or controller to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Handshake; only valid as the first message on a connection.
    Auth {
        /// Requested role, `device` or `controller`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Value>,
        /// Shared secret.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<Value>,
        /// Identity claimed by a device.
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<Value>,
    },
    /// Device telemetry to fan out to interested controllers.
    Telemetry {
        /// Opaque telemetry body.
        #[serde(default)]
        payload: Value,
    },
    /// Controller asks to receive telemetry from one device.
    Subscribe {
        /// Device of interest.
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<Value>,
    },
    /// Controller drops one device from its subscription set.
    Unsubscribe {
        /// Device no longer of interest.
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<Value>,
    },
    /// Controller command addressed to exactly one device.
    Command {
        /// Target device.
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<Value>,
        /// Opaque command body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Any `type` this relay does not know.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Decode one WebSocket payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the bytes are not a JSON object with a
    /// string `type` field, or a known type carries a structurally wrong body.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Wire name of the message type, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Telemetry { .. } => "telemetry",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Command { .. } => "command",
            Self::Unknown => "unknown",
        }
    }

    /// Handshake for a device.
    #[must_use]
    pub fn auth_device(token: &str, device_id: &str) -> Self {
        Self::Auth {
            role: Some(Value::from(Role::Device.as_str())),
            token: Some(Value::from(token)),
            device_id: Some(Value::from(device_id)),
        }
    }

    /// Handshake for a controller.
    #[must_use]
    pub fn auth_controller(token: &str) -> Self {
        Self::Auth {
            role: Some(Value::from(Role::Controller.as_str())),
            token: Some(Value::from(token)),
            device_id: None,
        }
    }

    /// Telemetry from a device.
    #[must_use]
    pub fn telemetry(payload: Value) -> Self {
        Self::Telemetry { payload }
    }

    /// Subscribe to one device.
    #[must_use]
    pub fn subscribe(device_id: &str) -> Self {
        Self::Subscribe {
            device_id: Some(Value::from(device_id)),
        }
    }

    /// Unsubscribe from one device.
    #[must_use]
    pub fn unsubscribe(device_id: &str) -> Self {
        Self::Unsubscribe {
            device_id: Some(Value::from(device_id)),
        }
    }

    /// Command for one device.
    #[must_use]
    pub fn command(device_id: &str, payload: Value) -> Self {
        Self::Command {
            device_id: Some(Value::from(device_id)),
            payload: Some(payload),
        }
    }

    /// Serialize to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error only if a payload value cannot be represented as JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Borrow a field as a non-empty string, or `None` if absent, empty or not a string.
#[must_use]
pub fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Message sent by the relay to a device or controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Successful handshake.
    Auth {
        /// Always `"ok"`.
        result: String,
        /// Confirmed role.
        role: Role,
        /// Confirmed identity, devices only.
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceId>,
    },
    /// Failure reply.
    Error {
        /// Human-readable failure class.
        message: String,
        /// Device the failure refers to, when there is one.
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceId>,
    },
    /// Telemetry fanned out to a controller.
    Telemetry {
        /// Originating device.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        /// Payload exactly as the device sent it.
        #[serde(default)]
        payload: Value,
    },
    /// Command delivered to a device.
    Command {
        /// Payload exactly as the controller sent it.
        #[serde(default)]
        payload: Value,
    },
    /// Subscription acknowledgment.
    Subscribed {
        /// Device added to the set.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    /// Unsubscription acknowledgment.
    Unsubscribed {
        /// Device removed from the set.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    /// Generic success reply.
    Ok {
        /// What succeeded.
        message: String,
    },
}

impl ServerMessage {
    /// Handshake acknowledgment.
    #[must_use]
    pub fn auth_ok(role: Role, device_id: Option<DeviceId>) -> Self {
        Self::Auth {
            result: AUTH_OK.to_string(),
            role,
            device_id,
        }
    }

    /// Error reply without a device reference.
    #[must_use]
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            device_id: None,
        }
    }

    /// Error reply naming the device it concerns.
    #[must_use]
    pub fn device_error(message: &str, device_id: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            device_id: Some(device_id.to_string()),
        }
    }

    /// Success reply.
    #[must_use]
    pub fn ok(message: &str) -> Self {
        Self::Ok {
            message: message.to_string(),
        }
    }

    /// Decode a relay message; used by clients and tests.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the bytes are not a known relay message.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Serialize to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error only if a payload value cannot be represented as JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
