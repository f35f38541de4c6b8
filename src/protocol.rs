//! Wire protocol for the relay.
//!
//! Every frame on the WebSocket is a JSON object tagged with a `type` field.
//! Clients send [`ClientEvent`]s and receive [`ServerEvent`]s; there are no
//! request/response pairs.  An event either causes pushes to zero or more
//! connections or is dropped.
//!
//! Malformed frames (unparseable JSON, unknown `type`, missing fields) are
//! dropped without a reply, so the enums double as the validation layer.

use serde::{Deserialize, Serialize};

/// Events a client sends over its WebSocket connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Claim an identity for this connection and trigger backlog replay.
    Register { identity: String },
    /// Send a text message to another identity.
    SendMessage {
        from: String,
        to: String,
        text: String,
    },
    /// Transient typing indicator; forwarded, never persisted.
    Typing { from: String, to: String },
}

impl ClientEvent {
    /// Parse a frame. Returns `None` for anything malformed.
    pub fn parse(text: &str) -> Option<ClientEvent> {
        serde_json::from_str(text).ok()
    }
}

/// Events the server pushes to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A chat message, delivered live, replayed from the backlog, or echoed
    /// back to its sender.
    Message {
        from: String,
        to: String,
        text: String,
        /// Server-assigned, unix milliseconds.
        timestamp: u64,
    },
    /// Broadcast to every connection when an identity goes on- or offline.
    StatusUpdate { identity: String, online: bool },
    /// Forwarded typing indicator.
    Typing { from: String, to: String },
}
