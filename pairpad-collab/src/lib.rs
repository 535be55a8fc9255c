//! # pairpad-collab — realtime sync engine for shared code-pads
//!
//! WebSocket-based multiplayer editing with room-scoped relay and
//! last-writer-wins full-buffer replacement.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per user)   │     JSON frames     │ (hub)        │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ EditorAgent  │                     │ RoomRegistry │
//! │ (debounce +  │                     │ (membership +│
//! │  echo guard) │                     │  N−1 fan-out)│
//! └──────────────┘                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire vocabulary (`ClientEvent` / `ServerEvent`)
//! - [`rooms`] — room registry and fan-out relay
//! - [`server`] — WebSocket hub
//! - [`client`] — hub client with bounded auto-reconnect
//! - [`editor`] — editor agent: debounced coalescing, echo suppression
//!
//! Live session state is memory-resident only: a room exists exactly while
//! it has members, and nothing survives the hub process. Reconnection
//! restores the transport channel but never room membership — callers
//! re-join explicitly.

pub mod protocol;
pub mod rooms;
pub mod server;
pub mod client;
pub mod editor;

// Re-exports for convenience
pub use protocol::{
    now_millis, ClientEvent, CursorPosition, Participant, ProtocolError, ServerEvent,
};
pub use rooms::{RelaySender, RelayStats, RoomRegistry};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{CollabClient, ConnectionState, ReconnectPolicy, SessionEvent};
pub use editor::{EditorAgent, DEBOUNCE_WINDOW};
