use crate::error::{AuthError, RelayError};
use devrelay_common::message::non_empty_str;
use devrelay_common::{ClientMessage, DeviceId, Role};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tungstenite::Message;

/// Authenticated state of a connection, fixed for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    /// A device answering to `device_id`.
    Device {
        /// Identity claimed at authentication.
        device_id: DeviceId,
    },
    /// A controller.
    Controller,
}

impl Session {
    /// Role of this session.
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::Device { .. } => Role::Device,
            Self::Controller => Role::Controller,
        }
    }

    /// Device identity, `None` for controllers.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Device { device_id } => Some(device_id),
            Self::Controller => None,
        }
    }
}

/// Validate a handshake payload against the shared secret.
///
/// Checks run in a fixed order (decode, type, token, role, device id) and the
/// first failure wins.
///
/// # Errors
///
/// Returns the [`AuthError`] describing the first failed check.
pub fn authenticate(data: &[u8], secret: &str) -> Result<Session, AuthError> {
    let ClientMessage::Auth {
        role,
        token,
        device_id,
    } = ClientMessage::decode(data)?
    else {
        return Err(AuthError::NotAuth);
    };

    if token.as_ref().and_then(Value::as_str) != Some(secret) {
        return Err(AuthError::InvalidToken);
    }

    let role = role
        .as_ref()
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .ok_or(AuthError::InvalidRole)?;

    match role {
        Role::Device => {
            let device_id = non_empty_str(device_id.as_ref()).ok_or(AuthError::MissingDeviceId)?;
            Ok(Session::Device {
                device_id: device_id.to_string(),
            })
        }
        Role::Controller => Ok(Session::Controller),
    }
}

/// Consume the first data message of a connection and authenticate it.
///
/// Control frames received before it are skipped.
///
/// # Errors
///
/// Returns [`RelayError::Auth`] on a rejected handshake, or a transport error
/// if the socket fails or closes first.
pub async fn admit<S>(ws_rx: &mut S, secret: &str) -> Result<Session, RelayError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = ws_rx
            .next()
            .await
            .ok_or(RelayError::ConnectionClosed)?
            .map_err(RelayError::WebSocket)?;

        let session = match msg {
            Message::Text(text) => authenticate(text.as_bytes(), secret)?,
            Message::Binary(data) => authenticate(&data, secret)?,
            Message::Close(_) => return Err(RelayError::ConnectionClosed),
            _ => continue,
        };
        return Ok(session);
    }
}
