//! WebSocket hub with room-based event routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("r1") ── RoomRegistry ── fan-out to N−1 peers
//! Client B ──┘                        │
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! One tokio task per connection. Each inbound frame is decoded into a
//! typed [`ClientEvent`]; the whole dispatch for one event — membership
//! mutation plus outbound fan-out — runs under a single registry guard, so
//! per-room delivery order matches dispatch order. Malformed frames and
//! mutation events from connections that are not members of the addressed
//! room are dropped with a warning, never relayed.
//!
//! Session state lives only in memory: a room exists exactly while it has
//! members, and nothing survives the process.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{now_millis, ClientEvent, Participant, ServerEvent};
use crate::rooms::{RelayStats, RoomRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room; joins beyond this are refused
    pub max_peers_per_room: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            max_peers_per_room: 50,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub active_rooms: usize,
}

/// The collaboration hub.
pub struct CollabServer {
    config: ServerConfig,
    /// Membership and fan-out; one guard per dispatched event.
    registry: Arc<Mutex<RoomRegistry>>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a new hub with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(RoomRegistry::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab hub listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection until it closes.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<Mutex<RoomRegistry>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // The registry key for this transport connection.
        let connection_id = Uuid::new_v4();
        log::info!("Connection {connection_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Relay channel: the registry fan-out pushes frames here; this task
        // drains them onto the socket. Closing the socket closes the channel,
        // which is how stale deliveries get dropped.
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                // Inbound frame from this client
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(raw))) => {
                            let event = match ClientEvent::decode(raw.as_str()) {
                                Ok(event) => event,
                                Err(e) => {
                                    log::warn!("Dropping malformed frame from {connection_id}: {e}");
                                    continue;
                                }
                            };
                            stats.write().await.frames_received += 1;

                            match event {
                                ClientEvent::JoinRoom { room_id, user_id, user_name } => {
                                    let room_count = {
                                        let mut reg = registry.lock().await;

                                        // One room per connection: joining a new
                                        // room leaves the old one first.
                                        for prior in reg.rooms_of(connection_id) {
                                            if prior == room_id {
                                                continue;
                                            }
                                            if let Some(left) = reg.unregister(&prior, connection_id) {
                                                let _ = reg.broadcast(&prior, &ServerEvent::UserLeft {
                                                    user_id: left.user_id,
                                                    user_name: left.user_name,
                                                    connection_id,
                                                }, None);
                                                log::info!("Connection {connection_id} moved out of room {prior}");
                                            }
                                        }

                                        if !reg.member_of(&room_id, connection_id)
                                            && reg.participants(&room_id).len() >= config.max_peers_per_room
                                        {
                                            log::warn!("Room {room_id} is full; refusing join from {connection_id}");
                                        } else {
                                            let participant = Participant {
                                                connection_id,
                                                user_id,
                                                user_name,
                                            };
                                            let others = reg.register(&room_id, participant.clone(), relay_tx.clone());
                                            let _ = reg.unicast(&room_id, connection_id, &ServerEvent::RoomUsers {
                                                participants: others,
                                            });
                                            let _ = reg.broadcast(&room_id, &ServerEvent::UserJoined {
                                                user_id: participant.user_id.clone(),
                                                user_name: participant.user_name.clone(),
                                                connection_id,
                                            }, Some(connection_id));
                                            log::info!(
                                                "{} ({connection_id}) joined room {room_id}",
                                                participant.user_name
                                            );
                                        }
                                        reg.room_count()
                                    };
                                    stats.write().await.active_rooms = room_count;
                                }

                                ClientEvent::LeaveRoom { room_id } => {
                                    let room_count = {
                                        let mut reg = registry.lock().await;
                                        if let Some(left) = reg.unregister(&room_id, connection_id) {
                                            let _ = reg.broadcast(&room_id, &ServerEvent::UserLeft {
                                                user_id: left.user_id,
                                                user_name: left.user_name.clone(),
                                                connection_id,
                                            }, None);
                                            log::info!("{} ({connection_id}) left room {room_id}", left.user_name);
                                        }
                                        reg.room_count()
                                    };
                                    stats.write().await.active_rooms = room_count;
                                }

                                ClientEvent::CodeChange { room_id, code, language, user_id } => {
                                    let reg = registry.lock().await;
                                    if !reg.member_of(&room_id, connection_id) {
                                        log::warn!("Dropping code-change for room {room_id} from non-member {connection_id}");
                                    } else {
                                        let _ = reg.broadcast(&room_id, &ServerEvent::CodeUpdate {
                                            code,
                                            language,
                                            user_id,
                                            timestamp: now_millis(),
                                        }, Some(connection_id));
                                    }
                                }

                                ClientEvent::CursorChange { room_id, position, user_id, user_name } => {
                                    let reg = registry.lock().await;
                                    if !reg.member_of(&room_id, connection_id) {
                                        log::warn!("Dropping cursor-change for room {room_id} from non-member {connection_id}");
                                    } else {
                                        let _ = reg.broadcast(&room_id, &ServerEvent::CursorUpdate {
                                            position,
                                            user_id,
                                            user_name,
                                            connection_id,
                                        }, Some(connection_id));
                                    }
                                }

                                ClientEvent::LanguageChange { room_id, language } => {
                                    let reg = registry.lock().await;
                                    // The sender's user id comes from its
                                    // registered participant record.
                                    match reg.member(&room_id, connection_id) {
                                        Some(member) => {
                                            let _ = reg.broadcast(&room_id, &ServerEvent::LanguageUpdate {
                                                language,
                                                user_id: member.user_id,
                                            }, Some(connection_id));
                                        }
                                        None => {
                                            log::warn!("Dropping language-change for room {room_id} from non-member {connection_id}");
                                        }
                                    }
                                }

                                ClientEvent::RunCode { room_id, code, language, user_id } => {
                                    let reg = registry.lock().await;
                                    if !reg.member_of(&room_id, connection_id) {
                                        log::warn!("Dropping run-code for room {room_id} from non-member {connection_id}");
                                    } else {
                                        let _ = reg.broadcast(&room_id, &ServerEvent::RunCode {
                                            code,
                                            language,
                                            user_id,
                                            timestamp: now_millis(),
                                        }, Some(connection_id));
                                    }
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {connection_id} closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::warn!("Transport error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outbound frame relayed from a room peer
                frame = relay_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_sender.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Cleanup: sweep every room this connection is still in (defensive —
        // the join path enforces one room, but the sweep makes disconnect
        // correct regardless) and notify the remaining members.
        let room_count = {
            let mut reg = registry.lock().await;
            let removed = reg.unregister_all(connection_id);
            for (room_id, participant) in &removed {
                let _ = reg.broadcast(room_id, &ServerEvent::UserLeft {
                    user_id: participant.user_id.clone(),
                    user_name: participant.user_name.clone(),
                    connection_id,
                }, None);
                log::info!(
                    "{} ({connection_id}) disconnected from room {room_id}",
                    participant.user_name
                );
            }
            reg.room_count()
        };

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = room_count;
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get relay statistics.
    pub async fn relay_stats(&self) -> RelayStats {
        self.registry.lock().await.stats()
    }

    /// Snapshot of a room's participants; empty if the room does not exist.
    pub async fn participants(&self, room_id: &str) -> Vec<Participant> {
        self.registry.lock().await.participants(room_id)
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.registry.lock().await.room_count()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
