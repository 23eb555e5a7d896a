//! Coordination hub: wires the registry, lock table, change log, resolver
//! and broadcast router together behind the three calls a connection makes.
//!
//! ```text
//!   join ──► SessionRegistry ──► BroadcastRouter (subscribe) ──► session_state
//!   handle ─► touch ─► ConflictResolver ─► LockTable / ChangeLog ─► publish
//!   leave ─► BroadcastRouter (unsubscribe) ─► SessionRegistry::leave ─► publish
//! ```
//!
//! Nothing here touches a socket, so the whole message flow can be driven
//! directly in tests.

use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastRouter, Envelope, PeerEntry};
use crate::changelog::ChangeLog;
use crate::config::ServerConfig;
use crate::error::{CollabError, CollabResult};
use crate::locks::{LockRequest, LockTable};
use crate::model::{ChangeEvent, ElementLock, Participant, UserIdentity};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::resolver::ConflictResolver;
use crate::session::{SessionRegistry, SessionStats};
use crate::storage::{EventStore, StoreConfig, StoreError};

/// One joined connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: Uuid,
    pub session_id: Uuid,
    pub diagram_id: Uuid,
    pub user: UserIdentity,
}

/// Everything a freshly joined connection needs.
pub struct JoinOutcome {
    pub connection: Connection,
    pub participant: Participant,
    /// `session_state` snapshot, to be sent before anything from `receiver`.
    pub snapshot: ServerMessage,
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
}

/// Result of one sweeper tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_locks: usize,
    pub ended_sessions: usize,
}

pub struct Hub {
    config: ServerConfig,
    registry: SessionRegistry,
    locks: Arc<LockTable>,
    log: Arc<ChangeLog>,
    resolver: ConflictResolver,
    router: BroadcastRouter,
    store: Option<Arc<EventStore>>,
}

impl Hub {
    /// Build the hub, opening the event store when a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(EventStore::open(store_config)?))
            }
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Option<Arc<EventStore>>) -> Self {
        let locks = Arc::new(LockTable::new());
        let log = Arc::new(ChangeLog::new(store.clone()));
        let registry = SessionRegistry::new(
            locks.clone(),
            log.clone(),
            store.clone(),
            config.max_peers_per_room,
        );
        let resolver = ConflictResolver::new(locks.clone(), log.clone(), config.undo_window());
        let router = BroadcastRouter::new(config.broadcast_capacity);
        Self {
            config,
            registry,
            locks,
            log,
            resolver,
            router,
            store,
        }
    }

    /// Restore persisted sessions and logs.
    pub async fn recover(&self) -> CollabResult<usize> {
        self.registry.recover().await
    }

    /// Join (or create) the diagram's session and subscribe to its room.
    pub async fn join(&self, diagram_id: Uuid, user: UserIdentity) -> CollabResult<JoinOutcome> {
        let joined = self.registry.join_or_create(diagram_id, &user).await?;
        let session_id = joined.session.id;
        let connection = Connection {
            connection_id: Uuid::new_v4(),
            session_id,
            diagram_id,
            user,
        };

        // Subscribe first: anything appended while the snapshot is built
        // arrives on the receiver too. Clients dedupe by sequence number.
        let receiver = self
            .router
            .join(
                session_id,
                PeerEntry {
                    connection_id: connection.connection_id,
                    user_id: connection.user.user_id,
                    display_name: connection.user.display_name.clone(),
                },
            )
            .await;

        let snapshot = match self.snapshot(&connection, &joined.participant).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.leave(&connection).await;
                return Err(e);
            }
        };

        let joined_msg = ServerMessage::UserJoined {
            participant: joined.participant.clone(),
        };
        self.publish(session_id, &joined_msg, Some(connection.connection_id)).await;

        Ok(JoinOutcome {
            connection,
            participant: joined.participant,
            snapshot,
            receiver,
        })
    }

    async fn snapshot(&self, conn: &Connection, participant: &Participant) -> CollabResult<ServerMessage> {
        let current_sequence = self.log.current_sequence(conn.session_id).await;
        let limit = self.config.recent_events_limit;
        let recent_events: Vec<ChangeEvent> = self
            .log
            .since(conn.session_id, current_sequence.saturating_sub(limit as u64))
            .await?
            .into_iter()
            .take_while(|e| e.sequence_number <= current_sequence)
            .collect();

        Ok(ServerMessage::SessionState {
            session_id: conn.session_id,
            diagram_id: conn.diagram_id,
            participant: participant.clone(),
            participants: self.registry.roster(conn.session_id).await?,
            recent_events,
            active_locks: self.locks.active_locks(conn.diagram_id).await,
            current_sequence,
        })
    }

    /// Dispatch one inbound message. `Ok(Some(_))` is a direct reply for the
    /// originating connection only; everything else goes out via the room.
    pub async fn handle(&self, conn: &Connection, msg: ClientMessage) -> CollabResult<Option<ServerMessage>> {
        let sid = conn.session_id;
        let user_id = conn.user.user_id;
        self.registry.touch(sid, user_id).await?;
        let participant = self.registry.active_participant(sid, user_id).await?;
        let room = self.router.room(sid).await;

        match msg {
            ClientMessage::DiagramChange { .. } => {
                let head = self.log.current_sequence(sid).await;
                let edit = msg
                    .into_edit(head)
                    .ok_or_else(|| CollabError::MalformedMessage("expected diagram_change".into()))?;
                let mut delivered = 0;
                let event = self
                    .resolver
                    .submit_then(conn.diagram_id, &participant, edit, |event| {
                        delivered = publish_in_room(room.as_deref(), &diagram_change(event), None);
                    })
                    .await?;
                self.record_delivery(&event, delivered).await;
                Ok(None)
            }

            ClientMessage::AcquireLock {
                element_id,
                element_path,
                lock_type,
                duration_minutes,
            } => {
                let request = LockRequest {
                    session_id: sid,
                    element_id,
                    element_path,
                    kind: lock_type,
                    holder: user_id,
                    ttl: self.config.lease(duration_minutes),
                };
                let acquired = self
                    .resolver
                    .acquire_lock_then(conn.diagram_id, &participant, request, |acquired| {
                        if let Some(prev) = &acquired.preempted {
                            publish_in_room(room.as_deref(), &ServerMessage::lock_released(prev), None);
                        }
                        publish_in_room(room.as_deref(), &ServerMessage::lock_acquired(&acquired.lock), None);
                    })
                    .await?;
                log::debug!(
                    "{} locked {} until {}",
                    conn.user.display_name,
                    acquired.lock.element_id,
                    acquired.lock.expires_at
                );
                Ok(None)
            }

            ClientMessage::ReleaseLock { element_id, element_path } => {
                let mut guard = self.locks.lock_diagram(conn.diagram_id).await;
                match guard.release(&element_id, &element_path, user_id) {
                    Some(lock) => {
                        publish_in_room(room.as_deref(), &ServerMessage::lock_released(&lock), None);
                        Ok(None)
                    }
                    None => Err(CollabError::NotFound(format!(
                        "no lock held on {element_id}"
                    ))),
                }
            }

            ClientMessage::SyncRequest { last_sequence_number } => {
                let events = self.log.since(sid, last_sequence_number).await?;
                let current_sequence = match events.last() {
                    Some(e) => e.sequence_number,
                    None => self.log.current_sequence(sid).await,
                };
                Ok(Some(ServerMessage::SyncResponse {
                    events,
                    current_sequence,
                }))
            }

            ClientMessage::CursorUpdate { cursor_data } => {
                let msg = ServerMessage::CursorUpdate { user_id, cursor_data };
                publish_in_room(room.as_deref(), &msg, Some(conn.connection_id));
                Ok(None)
            }

            ClientMessage::Undo { event_id } => {
                let mut delivered = 0;
                let event = self
                    .resolver
                    .undo_then(conn.diagram_id, &participant, event_id, |event| {
                        delivered = publish_in_room(room.as_deref(), &diagram_change(event), None);
                    })
                    .await?;
                self.record_delivery(&event, delivered).await;
                Ok(None)
            }

            ClientMessage::SetRole { user_id: target, role } => {
                let (updated, released) = self.registry.set_role(sid, user_id, target, role).await?;
                self.publish_released(sid, &released).await;
                self.publish(sid, &ServerMessage::RoleChanged { participant: updated }, None)
                    .await;
                Ok(None)
            }

            ClientMessage::Ping => Ok(Some(ServerMessage::pong())),

            // The gateway tears the connection down itself.
            ClientMessage::Leave => Ok(None),
        }
    }

    async fn record_delivery(&self, event: &ChangeEvent, delivered: usize) {
        if let Err(e) = self
            .log
            .record_broadcast(event.session_id, event.sequence_number, delivered)
            .await
        {
            log::warn!(
                "Could not record delivery of event #{} in session {}: {e}",
                event.sequence_number,
                event.session_id
            );
        }
    }

    /// Disconnect cleanup. Never fails; problems are logged.
    ///
    /// A user with another connection in the same session, including one
    /// still in the middle of joining, stays in the roster and keeps their
    /// locks. The registry counts connections, not room membership.
    pub async fn leave(&self, conn: &Connection) {
        let sid = conn.session_id;
        let user_id = conn.user.user_id;
        self.router.leave(sid, &conn.connection_id).await;

        match self.registry.leave(sid, user_id).await {
            Ok(None) => {}
            Ok(Some(released)) => {
                self.publish_released(sid, &released).await;
                let left = ServerMessage::UserLeft {
                    user_id,
                    display_name: conn.user.display_name.clone(),
                };
                self.publish(sid, &left, None).await;
            }
            Err(CollabError::SessionClosed(_)) => {
                log::debug!("Session {sid} already ended when {user_id} left");
            }
            Err(e) => log::error!("Cleanup for {user_id} in session {sid} failed: {e}"),
        }
    }

    /// End a session and tell anyone still connected which locks went away.
    pub async fn end_session(&self, session_id: Uuid) -> CollabResult<()> {
        let released = self.registry.end(session_id).await?;
        self.publish_released(session_id, &released).await;
        Ok(())
    }

    /// Expire stale locks and end sessions that stayed empty past the grace period.
    pub async fn sweep(&self) -> SweepReport {
        let expired = self.locks.sweep_expired().await;
        self.publish_released_each(&expired).await;

        let ended = self.registry.end_idle(self.config.empty_session_grace()).await;
        SweepReport {
            expired_locks: expired.len(),
            ended_sessions: ended.len(),
        }
    }

    async fn publish_released(&self, session_id: Uuid, locks: &[ElementLock]) {
        for lock in locks {
            self.publish(session_id, &ServerMessage::lock_released(lock), None).await;
        }
    }

    async fn publish_released_each(&self, locks: &[ElementLock]) {
        for lock in locks {
            self.publish(lock.session_id, &ServerMessage::lock_released(lock), None)
                .await;
        }
    }

    async fn publish(&self, session_id: Uuid, msg: &ServerMessage, origin: Option<Uuid>) -> usize {
        match self.router.publish(session_id, msg, origin).await {
            Ok(n) => n,
            Err(e) => {
                log::error!("Broadcast to session {session_id} failed: {e}");
                0
            }
        }
    }

    pub async fn stats(&self, session_id: Uuid) -> CollabResult<SessionStats> {
        self.registry.stats(session_id).await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn log(&self) -> &Arc<ChangeLog> {
        &self.log
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    pub fn store(&self) -> Option<&Arc<EventStore>> {
        self.store.as_ref()
    }
}

fn diagram_change(event: &ChangeEvent) -> ServerMessage {
    ServerMessage::DiagramChange {
        change_event: event.clone(),
    }
}

/// Synchronous publish for use inside a lock-table critical section.
fn publish_in_room(room: Option<&BroadcastGroup>, msg: &ServerMessage, origin: Option<Uuid>) -> usize {
    let Some(room) = room else {
        return 0;
    };
    match room.publish(msg, origin) {
        Ok(n) => n,
        Err(e) => {
            log::error!("Broadcast failed: {e}");
            0
        }
    }
}
