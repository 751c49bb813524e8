use devrelay_common::types::error_message;
use devrelay_common::ProtocolError;
use thiserror::Error;

/// Reasons the auth gate turns a connection away.
///
/// The `Display` text of each variant is the exact `message` sent to the
/// client in the `error` reply.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The first message could not be decoded.
    #[error("{}", error_message::INVALID_MESSAGE)]
    Protocol(#[from] ProtocolError),
    /// The first message was not of type `auth`.
    #[error("{}", error_message::EXPECTED_AUTH)]
    NotAuth,
    /// The shared secret did not match.
    #[error("{}", error_message::INVALID_TOKEN)]
    InvalidToken,
    /// `role` was missing or not one of `device` / `controller`.
    #[error("{}", error_message::INVALID_ROLE)]
    InvalidRole,
    /// A device did not supply a non-empty `deviceId`.
    #[error("{}", error_message::MISSING_DEVICE_ID)]
    MissingDeviceId,
}

impl AuthError {
    /// Short label used for metrics and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "malformed",
            Self::NotAuth => "not_auth",
            Self::InvalidToken => "bad_token",
            Self::InvalidRole => "bad_role",
            Self::MissingDeviceId => "missing_device_id",
        }
    }
}

/// Errors that end a single connection task.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The handshake was rejected.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    /// The client sent nothing within the handshake window.
    #[error("authentication timed out")]
    AuthTimeout,
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Outbound message could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
}
