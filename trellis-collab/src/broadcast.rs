//! Per-session fan-out with bounded, independent buffering.
//!
//! Each session room owns one tokio broadcast channel. A message is encoded
//! once and every connection receives the same `Arc`, in publish order.
//! A receiver that falls more than `capacity` messages behind gets
//! `RecvError::Lagged`; the gateway disconnects it instead of letting it
//! hold the room back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::CollabResult;
use crate::protocol::ServerMessage;

/// One encoded outbound frame.
#[derive(Debug)]
pub struct Envelope {
    /// Connection that caused the message, if any.
    pub origin: Option<Uuid>,
    pub exclude_origin: bool,
    pub payload: Arc<str>,
}

impl Envelope {
    /// Whether the connection `connection_id` should forward this frame.
    pub fn delivers_to(&self, connection_id: Uuid) -> bool {
        !(self.exclude_origin && self.origin == Some(connection_id))
    }
}

/// A connection joined to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_undelivered: u64,
    pub active_peers: usize,
}

/// Fan-out group for a single session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    peers: RwLock<HashMap<Uuid, PeerEntry>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_undelivered: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_undelivered: AtomicU64::new(0),
        }
    }

    /// Register a connection and hand back its receiver.
    pub async fn add_peer(&self, entry: PeerEntry) -> broadcast::Receiver<Arc<Envelope>> {
        let mut peers = self.peers.write().await;
        // Subscribe under the peer lock so a concurrent publish either counts us or misses us entirely
        let rx = self.sender.subscribe();
        peers.insert(entry.connection_id, entry);
        rx
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<PeerEntry> {
        self.peers.write().await.remove(connection_id)
    }

    /// Publish an encoded message. Returns how many connections will deliver it.
    pub fn publish_raw(&self, envelope: Arc<Envelope>) -> usize {
        let excluded = envelope.exclude_origin && envelope.origin.is_some();
        let receivers = match self.sender.send(envelope) {
            Ok(n) => n,
            Err(_) => {
                self.messages_undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        };
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        if excluded {
            receivers.saturating_sub(1)
        } else {
            receivers
        }
    }

    pub fn publish(&self, msg: &ServerMessage, origin: Option<Uuid>) -> CollabResult<usize> {
        let envelope = Envelope {
            origin,
            exclude_origin: msg.excludes_origin(),
            payload: Arc::from(msg.encode()?),
        };
        Ok(self.publish_raw(Arc::new(envelope)))
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerEntry> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_undelivered: self.messages_undelivered.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps session ids to their broadcast groups.
///
/// The per-session connection registry lives here; rooms are created on
/// first join and dropped when their last connection leaves.
pub struct BroadcastRouter {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl BroadcastRouter {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for a session.
    pub async fn get_or_create(&self, session_id: Uuid) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&session_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&session_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(session_id, room.clone());
        room
    }

    pub async fn room(&self, session_id: Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(&session_id).cloned()
    }

    /// Join a connection to a session's room.
    pub async fn join(&self, session_id: Uuid, entry: PeerEntry) -> broadcast::Receiver<Arc<Envelope>> {
        // The room may be pruned between get_or_create and add_peer; retry onto the live one.
        loop {
            let room = self.get_or_create(session_id).await;
            let rx = room.add_peer(entry.clone()).await;
            let rooms = self.rooms.read().await;
            if rooms.get(&session_id).is_some_and(|live| Arc::ptr_eq(live, &room)) {
                return rx;
            }
            drop(rooms);
            room.remove_peer(&entry.connection_id).await;
        }
    }

    /// Remove a connection; drops the room once it is empty.
    pub async fn leave(&self, session_id: Uuid, connection_id: &Uuid) -> Option<PeerEntry> {
        let room = self.room(session_id).await?;
        let removed = room.remove_peer(connection_id).await;
        if self.remove_if_empty(&session_id).await {
            log::info!("Room {session_id} removed (empty)");
        }
        removed
    }

    /// Publish to a session's room. A session without a room has no
    /// listeners and yields 0.
    pub async fn publish(&self, session_id: Uuid, msg: &ServerMessage, origin: Option<Uuid>) -> CollabResult<usize> {
        match self.room(session_id).await {
            Some(room) => room.publish(msg, origin),
            None => Ok(0),
        }
    }

    pub async fn remove_if_empty(&self, session_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(session_id) {
            if room.peer_count().await == 0 {
                rooms.remove(session_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn peer(name: &str) -> PeerEntry {
        PeerEntry {
            connection_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");
        let conn = alice.connection_id;

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&conn).await);

        group.remove_peer(&conn).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&conn).await);
    }

    #[tokio::test]
    async fn test_fan_out_includes_originator() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");
        let origin = alice.connection_id;
        let mut rx1 = group.add_peer(alice).await;
        let mut rx2 = group.add_peer(peer("Bob")).await;
        let mut rx3 = group.add_peer(peer("Carol")).await;

        let count = group.publish(&ServerMessage::pong(), Some(origin)).unwrap();
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let env = rx.recv().await.unwrap();
            assert!(env.delivers_to(origin));
        }
    }

    #[tokio::test]
    async fn test_cursor_echo_excludes_originator() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");
        let bob = peer("Bob");
        let (a, b) = (alice.connection_id, bob.connection_id);
        let mut rx_a = group.add_peer(alice).await;
        let _rx_b = group.add_peer(bob).await;

        let cursor = ServerMessage::CursorUpdate {
            user_id: Uuid::new_v4(),
            cursor_data: serde_json::json!({"x": 10, "y": 20}),
        };
        assert_eq!(group.publish(&cursor, Some(a)).unwrap(), 1);

        let env = rx_a.recv().await.unwrap();
        assert!(!env.delivers_to(a));
        assert!(env.delivers_to(b));
    }

    #[tokio::test]
    async fn test_publish_order_is_preserved() {
        let group = BroadcastGroup::new(64);
        let mut rx = group.add_peer(peer("Alice")).await;

        for i in 0..10u64 {
            let msg = ServerMessage::SyncResponse { events: Vec::new(), current_sequence: i };
            group.publish(&msg, None).unwrap();
        }
        for i in 0..10u64 {
            let env = rx.recv().await.unwrap();
            match ServerMessage::decode(&env.payload).unwrap() {
                ServerMessage::SyncResponse { current_sequence, .. } => assert_eq!(current_sequence, i),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_receiver_lags_without_blocking_publisher() {
        let group = BroadcastGroup::new(4);
        let mut slow = group.add_peer(peer("Slow")).await;

        for _ in 0..20 {
            group.publish(&ServerMessage::pong(), None).unwrap();
        }
        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn test_publish_without_listeners() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.publish(&ServerMessage::pong(), None).unwrap(), 0);
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_undelivered, 1);
    }

    #[tokio::test]
    async fn test_router_get_or_create() {
        let router = BroadcastRouter::new(16);
        let sid = Uuid::new_v4();

        let room1 = router.get_or_create(sid).await;
        let room2 = router.get_or_create(sid).await;
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(router.room_count().await, 1);
        assert_eq!(room1.capacity(), 16);
    }

    #[tokio::test]
    async fn test_router_isolates_sessions() {
        let router = BroadcastRouter::new(16);
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        let mut rx1 = router.join(s1, peer("Alice")).await;
        let mut rx2 = router.join(s2, peer("Bob")).await;

        assert_eq!(router.publish(s1, &ServerMessage::pong(), None).await.unwrap(), 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());

        let sessions = router.active_sessions().await;
        assert!(sessions.contains(&s1));
        assert!(sessions.contains(&s2));
    }

    #[tokio::test]
    async fn test_router_drops_empty_rooms() {
        let router = BroadcastRouter::new(16);
        let sid = Uuid::new_v4();
        let alice = peer("Alice");
        let bob = peer("Bob");
        let (a, b) = (alice.connection_id, bob.connection_id);

        let _rx_a = router.join(sid, alice).await;
        let _rx_b = router.join(sid, bob).await;

        assert_eq!(router.leave(sid, &a).await.map(|p| p.display_name), Some("Alice".into()));
        assert_eq!(router.room_count().await, 1);

        router.leave(sid, &b).await;
        assert_eq!(router.room_count().await, 0);
        assert_eq!(router.publish(sid, &ServerMessage::pong(), None).await.unwrap(), 0);
    }
}
