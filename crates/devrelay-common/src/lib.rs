//! Common types shared across the devrelay protocol stack.
//!
//! This crate provides:
//! - JSON message envelopes and decoding ([`message`])
//! - Role type and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod message;
pub mod types;

pub use message::{ClientMessage, ProtocolError, ServerMessage};
pub use types::{DeviceId, Role};
