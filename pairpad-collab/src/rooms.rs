//! Room registry and N−1 event fan-out.
//!
//! A [`Room`] is a set of peers keyed by connection id, each holding the
//! outbound channel of its connection task. [`RoomRegistry`] is the sole
//! source of truth for membership: rooms are created on first join and
//! removed the moment their last peer leaves — an empty room never lingers.
//!
//! The relay encodes each event once and pushes the shared frame to every
//! peer channel except the originator's. Delivery is fire-and-forget: a
//! closed channel drops that delivery silently (counted, never surfaced to
//! the sender). Per-room ordering follows broadcast call order; callers
//! serialize calls by holding the registry guard for the whole dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

use crate::protocol::{Participant, ProtocolError, ServerEvent};

/// Outbound channel half registered for a connection.
pub type RelaySender = mpsc::UnboundedSender<Utf8Bytes>;

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Broadcast/unicast calls issued.
    pub frames_sent: u64,
    /// Per-peer deliveries that reached an open channel.
    pub deliveries: u64,
    /// Per-peer deliveries dropped on a closed channel.
    pub dropped: u64,
}

/// Lock-free relay counters; read via snapshot().
struct AtomicRelayStats {
    frames_sent: AtomicU64,
    deliveries: AtomicU64,
    dropped: AtomicU64,
}

impl AtomicRelayStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Peer {
    participant: Participant,
    sender: RelaySender,
}

/// One room's peers. Only reachable through [`RoomRegistry`] operations.
struct Room {
    peers: HashMap<Uuid, Peer>,
}

impl Room {
    fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    fn participants(&self) -> Vec<Participant> {
        self.peers.values().map(|p| p.participant.clone()).collect()
    }
}

/// In-memory map from room id to its active peers.
///
/// All mutation is `&mut self`; the surrounding server serializes access by
/// holding one guard across an inbound event's registry mutation and fan-out,
/// which preserves per-room broadcast order.
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    stats: AtomicRelayStats,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            stats: AtomicRelayStats::new(),
        }
    }

    /// Insert a peer, creating the room if absent.
    ///
    /// Re-registering an existing connection id silently overwrites — the
    /// desired semantics for reconnect-and-rejoin. Returns the room's other
    /// participants as they were before insertion (the `room-users` payload
    /// for the joiner).
    pub fn register(
        &mut self,
        room_id: &str,
        participant: Participant,
        sender: RelaySender,
    ) -> Vec<Participant> {
        let room = self.rooms.entry(room_id.to_string()).or_insert_with(Room::new);
        let others = room
            .peers
            .values()
            .filter(|p| p.participant.connection_id != participant.connection_id)
            .map(|p| p.participant.clone())
            .collect();
        room.peers
            .insert(participant.connection_id, Peer { participant, sender });
        others
    }

    /// Remove a peer from one named room; no-op if absent.
    ///
    /// Deletes the room immediately when this removal empties it.
    pub fn unregister(&mut self, room_id: &str, connection_id: Uuid) -> Option<Participant> {
        let room = self.rooms.get_mut(room_id)?;
        let removed = room.peers.remove(&connection_id)?;
        if room.peers.is_empty() {
            self.rooms.remove(room_id);
            log::debug!("Room {room_id} removed (empty)");
        }
        Some(removed.participant)
    }

    /// Remove a connection from every room containing it.
    ///
    /// Defensive sweep used on disconnect. Returns the (room id, removed
    /// participant) pairs; emptied rooms are deleted in the same pass.
    pub fn unregister_all(&mut self, connection_id: Uuid) -> Vec<(String, Participant)> {
        let mut removed = Vec::new();
        self.rooms.retain(|room_id, room| {
            if let Some(peer) = room.peers.remove(&connection_id) {
                removed.push((room_id.clone(), peer.participant));
            }
            if room.peers.is_empty() {
                log::debug!("Room {room_id} removed (empty)");
                false
            } else {
                true
            }
        });
        removed
    }

    /// Snapshot of a room's participants; empty for unknown rooms.
    pub fn participants(&self, room_id: &str) -> Vec<Participant> {
        self.rooms
            .get(room_id)
            .map(Room::participants)
            .unwrap_or_default()
    }

    /// Whether the connection is currently registered in the room.
    pub fn member_of(&self, room_id: &str, connection_id: Uuid) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.peers.contains_key(&connection_id))
    }

    /// The registered participant record for a connection in a room.
    pub fn member(&self, room_id: &str, connection_id: Uuid) -> Option<Participant> {
        self.rooms
            .get(room_id)?
            .peers
            .get(&connection_id)
            .map(|p| p.participant.clone())
    }

    /// Every room currently containing the connection.
    pub fn rooms_of(&self, connection_id: Uuid) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|(_, room)| room.peers.contains_key(&connection_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Deliver `event` to every peer in the room except `exclude`.
    ///
    /// The frame is encoded once and shared across deliveries. Returns the
    /// number of open channels reached; closed channels are skipped silently.
    /// Broadcasting to an unknown room delivers to nobody.
    pub fn broadcast(
        &self,
        room_id: &str,
        event: &ServerEvent,
        exclude: Option<Uuid>,
    ) -> Result<usize, ProtocolError> {
        let Some(room) = self.rooms.get(room_id) else {
            return Ok(0);
        };
        let frame: Utf8Bytes = event.encode()?.into();
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for peer in room.peers.values() {
            if Some(peer.participant.connection_id) == exclude {
                continue;
            }
            if peer.sender.send(frame.clone()).is_ok() {
                delivered += 1;
                self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(delivered)
    }

    /// Deliver `event` to a single registered connection.
    ///
    /// Used for the `room-users` reply to a joiner; routing through the same
    /// channel as broadcasts keeps delivery ordered with them.
    pub fn unicast(
        &self,
        room_id: &str,
        connection_id: Uuid,
        event: &ServerEvent,
    ) -> Result<bool, ProtocolError> {
        let Some(peer) = self
            .rooms
            .get(room_id)
            .and_then(|room| room.peers.get(&connection_id))
        else {
            return Ok(false);
        };
        let frame: Utf8Bytes = event.encode()?.into();
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        if peer.sender.send(frame).is_ok() {
            self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        } else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            Ok(false)
        }
    }

    /// Relay statistics snapshot.
    pub fn stats(&self) -> RelayStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn participant(user: &str) -> Participant {
        Participant {
            connection_id: Uuid::new_v4(),
            user_id: user.to_lowercase(),
            user_name: user.to_string(),
        }
    }

    fn join(
        registry: &mut RoomRegistry,
        room: &str,
        user: &str,
    ) -> (Participant, UnboundedReceiver<Utf8Bytes>) {
        let p = participant(user);
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(room, p.clone(), tx);
        (p, rx)
    }

    fn decode(frame: Utf8Bytes) -> ServerEvent {
        ServerEvent::decode(frame.as_str()).unwrap()
    }

    #[test]
    fn test_register_creates_room() {
        let mut registry = RoomRegistry::new();
        assert_eq!(registry.room_count(), 0);

        let (alice, _rx) = join(&mut registry, "r1", "Alice");
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.participants("r1"), vec![alice]);
    }

    #[test]
    fn test_register_returns_pre_insertion_snapshot() {
        let mut registry = RoomRegistry::new();
        let (alice, _rx_a) = join(&mut registry, "r1", "Alice");

        let bob = participant("Bob");
        let (tx, _rx_b) = mpsc::unbounded_channel();
        let others = registry.register("r1", bob.clone(), tx);
        assert_eq!(others, vec![alice]);
        assert_eq!(registry.participants("r1").len(), 2);
    }

    #[test]
    fn test_register_overwrites_same_connection() {
        let mut registry = RoomRegistry::new();
        let (alice, _rx) = join(&mut registry, "r1", "Alice");

        // Rejoin under the same connection id: silent overwrite, and the
        // snapshot never lists the joiner itself.
        let (tx, _rx2) = mpsc::unbounded_channel();
        let others = registry.register("r1", alice.clone(), tx);
        assert!(others.is_empty());
        assert_eq!(registry.participants("r1").len(), 1);
    }

    #[test]
    fn test_unregister_removes_empty_room() {
        let mut registry = RoomRegistry::new();
        let (alice, _rx) = join(&mut registry, "r1", "Alice");

        let removed = registry.unregister("r1", alice.connection_id);
        assert_eq!(removed, Some(alice));
        assert_eq!(registry.room_count(), 0);
        assert!(registry.participants("r1").is_empty());
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let mut registry = RoomRegistry::new();
        let (_alice, _rx) = join(&mut registry, "r1", "Alice");

        assert!(registry.unregister("r1", Uuid::new_v4()).is_none());
        assert!(registry.unregister("nope", Uuid::new_v4()).is_none());
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn test_unregister_all_sweeps_every_room() {
        let mut registry = RoomRegistry::new();
        let conn = Uuid::new_v4();
        for room in ["r1", "r2"] {
            let p = Participant {
                connection_id: conn,
                user_id: "u1".into(),
                user_name: "Alice".into(),
            };
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.register(room, p, tx);
        }
        let (_bob, _rx) = join(&mut registry, "r2", "Bob");

        let mut removed = registry.unregister_all(conn);
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].0, "r1");
        assert_eq!(removed[1].0, "r2");

        // r1 emptied and deleted; r2 survives with Bob.
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.participants("r2").len(), 1);
    }

    #[test]
    fn test_membership_probes() {
        let mut registry = RoomRegistry::new();
        let (alice, _rx) = join(&mut registry, "r1", "Alice");

        assert!(registry.member_of("r1", alice.connection_id));
        assert!(!registry.member_of("r2", alice.connection_id));
        assert_eq!(
            registry.member("r1", alice.connection_id),
            Some(alice.clone())
        );
        assert_eq!(registry.rooms_of(alice.connection_id), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_originator() {
        let mut registry = RoomRegistry::new();
        let (alice, mut rx_a) = join(&mut registry, "r1", "Alice");
        let (_bob, mut rx_b) = join(&mut registry, "r1", "Bob");

        let event = ServerEvent::LanguageUpdate {
            language: "rust".into(),
            user_id: alice.user_id.clone(),
        };
        let delivered = registry
            .broadcast("r1", &event, Some(alice.connection_id))
            .unwrap();
        assert_eq!(delivered, 1);

        assert_eq!(decode(rx_b.recv().await.unwrap()), event);
        assert!(rx_a.try_recv().is_err(), "originator must not hear itself");
    }

    #[tokio::test]
    async fn test_broadcast_drops_closed_channels() {
        let mut registry = RoomRegistry::new();
        let (_alice, rx_a) = join(&mut registry, "r1", "Alice");
        let (_bob, mut rx_b) = join(&mut registry, "r1", "Bob");
        drop(rx_a);

        let event = ServerEvent::LanguageUpdate {
            language: "go".into(),
            user_id: "u9".into(),
        };
        let delivered = registry.broadcast("r1", &event, None).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(decode(rx_b.recv().await.unwrap()), event);

        let stats = registry.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.deliveries, 1);
    }

    #[test]
    fn test_broadcast_unknown_room_delivers_nothing() {
        let registry = RoomRegistry::new();
        let event = ServerEvent::LanguageUpdate {
            language: "go".into(),
            user_id: "u1".into(),
        };
        assert_eq!(registry.broadcast("ghost", &event, None).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unicast_reaches_one_peer() {
        let mut registry = RoomRegistry::new();
        let (alice, mut rx_a) = join(&mut registry, "r1", "Alice");
        let (_bob, mut rx_b) = join(&mut registry, "r1", "Bob");

        let event = ServerEvent::RoomUsers {
            participants: vec![],
        };
        assert!(registry
            .unicast("r1", alice.connection_id, &event)
            .unwrap());
        assert_eq!(decode(rx_a.recv().await.unwrap()), event);
        assert!(rx_b.try_recv().is_err());

        assert!(!registry.unicast("r1", Uuid::new_v4(), &event).unwrap());
    }

    #[test]
    fn test_room_isolation() {
        let mut registry = RoomRegistry::new();
        let (_alice, mut rx_a) = join(&mut registry, "r1", "Alice");
        let (_bob, mut rx_b) = join(&mut registry, "r2", "Bob");

        let event = ServerEvent::LanguageUpdate {
            language: "c".into(),
            user_id: "u1".into(),
        };
        registry.broadcast("r2", &event, None).unwrap();

        assert!(rx_a.try_recv().is_err(), "r1 must not see r2 traffic");
        assert!(rx_b.try_recv().is_ok());
    }
}
