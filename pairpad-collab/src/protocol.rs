//! JSON wire protocol for room-based editing sessions.
//!
//! Every frame is a single JSON text message:
//! ```text
//! {"event":"code-change","data":{"roomId":"r1","code":"x = 1","language":"python","userId":"u2"}}
//! ```
//!
//! Two closed vocabularies share this envelope: [`ClientEvent`] flows
//! client → hub and carries a `roomId` used for routing only; [`ServerEvent`]
//! flows hub → client with the room id stripped. There is no schema
//! versioning and no binary framing — all session state is transient.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A connection's identity within a room.
///
/// `connection_id` is assigned hub-side per transport connection and is the
/// registry key. `user_id` and `user_name` are caller-supplied and not
/// validated for uniqueness — two connections may claim the same user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: Uuid,
    pub user_id: String,
    pub user_name: String,
}

/// Zero-based editor coordinates for a cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Events a client sends to the hub.
///
/// The `room_id` addresses the target room; it is consumed by the hub for
/// routing and never appears in the delivered [`ServerEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Enter a room, announcing the caller's identity.
    JoinRoom {
        room_id: String,
        user_id: String,
        user_name: String,
    },
    /// Leave one room explicitly (disconnects are handled hub-side).
    LeaveRoom { room_id: String },
    /// Debounced full-buffer code replacement.
    CodeChange {
        room_id: String,
        code: String,
        language: String,
        user_id: String,
    },
    /// Cursor moved; relayed without coalescing.
    CursorChange {
        room_id: String,
        position: CursorPosition,
        user_id: String,
        user_name: String,
    },
    /// Language selection switched.
    LanguageChange { room_id: String, language: String },
    /// Ask every peer to execute the same buffer locally.
    RunCode {
        room_id: String,
        code: String,
        language: String,
        user_id: String,
    },
}

impl ClientEvent {
    /// The room this event addresses.
    pub fn room_id(&self) -> &str {
        match self {
            ClientEvent::JoinRoom { room_id, .. }
            | ClientEvent::LeaveRoom { room_id }
            | ClientEvent::CodeChange { room_id, .. }
            | ClientEvent::CursorChange { room_id, .. }
            | ClientEvent::LanguageChange { room_id, .. }
            | ClientEvent::RunCode { room_id, .. } => room_id,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from a JSON text frame. Anything that does not match the
    /// closed vocabulary fails — callers drop and log, never propagate.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Events the hub delivers to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Unicast to a joiner: everyone already in the room.
    RoomUsers { participants: Vec<Participant> },
    /// A peer entered the room.
    UserJoined {
        user_id: String,
        user_name: String,
        connection_id: Uuid,
    },
    /// A peer left or disconnected.
    UserLeft {
        user_id: String,
        user_name: String,
        connection_id: Uuid,
    },
    /// Full-buffer replacement from a peer. `timestamp` is hub-stamped.
    CodeUpdate {
        code: String,
        language: String,
        user_id: String,
        timestamp: u64,
    },
    /// A peer's cursor moved.
    CursorUpdate {
        position: CursorPosition,
        user_id: String,
        user_name: String,
        connection_id: Uuid,
    },
    /// A peer switched languages.
    LanguageUpdate { language: String, user_id: String },
    /// A peer requested a run; every member executes the same buffer.
    RunCode {
        code: String,
        language: String,
        user_id: String,
        timestamp: u64,
    },
}

impl ServerEvent {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Milliseconds since the Unix epoch, as stamped on relayed updates.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
