//! Core type definitions and protocol constants for devrelay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity a device claims when it authenticates.
pub type DeviceId = String;

/// Role a connection takes on for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Telemetry source and command recipient, identified by a [`DeviceId`].
    Device,
    /// Operator client: sends commands, subscribes to telemetry.
    Controller,
}

impl Role {
    /// Parse the wire spelling of a role. Matching is exact.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "device" => Some(Self::Device),
            "controller" => Some(Self::Controller),
            _ => None,
        }
    }

    /// Wire spelling of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Controller => "controller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `result` value of a successful `auth` acknowledgment.
pub const AUTH_OK: &str = "ok";

/// `message` value of the `ok` reply to a forwarded command.
pub const COMMAND_FORWARDED: &str = "command forwarded";

/// Reasons carried in `error` messages from relay to client.
pub mod error_message {
    /// The message was not a JSON object with a string `type`.
    pub const INVALID_MESSAGE: &str = "invalid message";
    /// The first message on a connection was not `auth`.
    pub const EXPECTED_AUTH: &str = "expected auth message";
    /// The shared secret did not match.
    pub const INVALID_TOKEN: &str = "invalid token";
    /// `role` was neither `device` nor `controller`.
    pub const INVALID_ROLE: &str = "invalid role";
    /// A device tried to authenticate without a usable `deviceId`.
    pub const MISSING_DEVICE_ID: &str = "deviceId required for device role";
    /// No `auth` message arrived within the handshake window.
    pub const AUTH_TIMEOUT: &str = "authentication timeout";
    /// `command` without a `deviceId`.
    pub const COMMAND_REQUIRES_DEVICE_ID: &str = "command requires deviceId";
    /// `command` without a `payload`.
    pub const COMMAND_REQUIRES_PAYLOAD: &str = "command requires payload";
    /// The command target has no live connection.
    pub const DEVICE_NOT_CONNECTED: &str = "device not connected";
    /// The command target's outbound queue is full.
    pub const DEVICE_BUSY: &str = "device busy";
}
