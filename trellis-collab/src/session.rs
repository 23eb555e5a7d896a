//! Session registry: session identity, participant roster and status.
//!
//! Sessions are indexed by id and, while `ACTIVE`, by diagram. Each session
//! sits behind its own mutex; the index lock is only held long enough to find
//! or create a slot, so joins to different diagrams do not contend.
//!
//! An `ENDED` session is immutable: every mutating operation on it returns
//! `SessionClosed`. Ending evicts the session from memory; reads of it are
//! served from the store afterwards.
//!
//! A participant stays `ACTIVE` while they have at least one open
//! connection. The count lives on the participant and changes only under the
//! session's mutex, so a reconnect racing a disconnect cannot strand them.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::changelog::ChangeLog;
use crate::error::{CollabError, CollabResult};
use crate::locks::LockTable;
use crate::model::{
    ElementLock, EventType, Participant, ParticipantRole, ParticipantStatus, Session,
    SessionStatus, UserIdentity,
};
use crate::storage::{EventStore, StoreError};

type SessionSlot = Arc<Mutex<Session>>;

#[derive(Default)]
struct Index {
    sessions: HashMap<Uuid, SessionSlot>,
    /// diagram id → its ACTIVE session
    active: HashMap<Uuid, Uuid>,
    /// Sessions ended by this process or found ended at recovery.
    ended: HashSet<Uuid>,
}

/// Outcome of a join.
#[derive(Debug, Clone)]
pub struct Joined {
    pub session: Session,
    pub participant: Participant,
    /// True when this join created the session.
    pub created: bool,
}

/// Roster and log summary for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub diagram_id: Uuid,
    pub status: SessionStatus,
    pub participants_total: usize,
    pub participants_active: usize,
    pub participants_by_role: HashMap<ParticipantRole, usize>,
    pub events_total: u64,
    pub events_by_type: HashMap<EventType, usize>,
    pub current_sequence: u64,
    pub active_locks: usize,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: i64,
}

pub struct SessionRegistry {
    index: RwLock<Index>,
    locks: Arc<LockTable>,
    log: Arc<ChangeLog>,
    store: Option<Arc<EventStore>>,
    max_active_participants: usize,
}

impl SessionRegistry {
    pub fn new(
        locks: Arc<LockTable>,
        log: Arc<ChangeLog>,
        store: Option<Arc<EventStore>>,
        max_active_participants: usize,
    ) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            locks,
            log,
            store,
            max_active_participants,
        }
    }

    async fn persist(&self, session: &Session) -> CollabResult<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let record = session.clone();
        tokio::task::spawn_blocking(move || store.save_session(&record))
            .await
            .map_err(|e| CollabError::InternalFailure(e.to_string()))?
            .map_err(|e| {
                log::error!("Failed to persist session {}: {e}", session.id);
                CollabError::from(e)
            })
    }

    /// The live session's slot. Ended sessions are `SessionClosed`.
    async fn slot(&self, session_id: Uuid) -> CollabResult<SessionSlot> {
        let index = self.index.read().await;
        if let Some(slot) = index.sessions.get(&session_id) {
            return Ok(slot.clone());
        }
        if index.ended.contains(&session_id) {
            return Err(CollabError::SessionClosed(session_id));
        }
        Err(CollabError::NotFound(format!("session {session_id}")))
    }

    /// A session that is no longer in memory, read from the store.
    async fn archived(&self, session_id: Uuid) -> CollabResult<Session> {
        let Some(store) = self.store.clone() else {
            return Err(CollabError::NotFound(format!("session {session_id}")));
        };
        tokio::task::spawn_blocking(move || store.load_session(session_id))
            .await
            .map_err(|e| CollabError::InternalFailure(e.to_string()))?
            .map_err(|e| match e {
                StoreError::NotFound(_) => CollabError::NotFound(format!("session {session_id}")),
                e => CollabError::from(e),
            })
    }

    /// Load live sessions and their change logs from the store.
    ///
    /// Nobody is connected after a restart, so every participant comes back
    /// `LEFT` and active sessions start their idle grace period now. Ended
    /// sessions stay in the store and are only remembered by id.
    pub async fn recover(&self) -> CollabResult<usize> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };

        let loader = store.clone();
        let sessions = tokio::task::spawn_blocking(move || loader.list_sessions())
            .await
            .map_err(|e| CollabError::InternalFailure(e.to_string()))??;

        let now = Utc::now();
        let mut recovered = 0;
        for mut session in sessions {
            let sid = session.id;
            for p in &mut session.participants {
                if p.is_active() {
                    p.status = ParticipantStatus::Left;
                    p.left_at = Some(now);
                }
            }

            if session.is_ended() {
                self.index.write().await.ended.insert(sid);
                continue;
            }
            let duplicate = self.index.read().await.active.contains_key(&session.diagram_id);
            if duplicate {
                log::warn!(
                    "Diagram {} has more than one stored active session; ending {sid}",
                    session.diagram_id
                );
                session.status = SessionStatus::Ended;
                session.ended_at = Some(now);
                self.persist(&session).await?;
                self.index.write().await.ended.insert(sid);
                continue;
            }

            let loader = store.clone();
            let events = tokio::task::spawn_blocking(move || loader.load_all_events(sid))
                .await
                .map_err(|e| CollabError::InternalFailure(e.to_string()))??;
            let event_count = events.len();
            self.log.restore(sid, events).await?;

            if session.emptied_at.is_none() {
                session.emptied_at = Some(now);
            }
            let mut index = self.index.write().await;
            index.active.insert(session.diagram_id, sid);
            index.sessions.insert(sid, Arc::new(Mutex::new(session)));
            drop(index);

            log::debug!("Recovered session {sid} with {event_count} events");
            recovered += 1;
        }

        log::info!("Session recovery complete: {recovered} sessions restored");
        Ok(recovered)
    }

    /// Join the diagram's active session, creating it (with the joiner as
    /// host) when none exists. Rejoining is idempotent.
    pub async fn join_or_create(&self, diagram_id: Uuid, identity: &UserIdentity) -> CollabResult<Joined> {
        loop {
            let existing = {
                let index = self.index.read().await;
                index
                    .active
                    .get(&diagram_id)
                    .and_then(|sid| index.sessions.get(sid))
                    .cloned()
            };

            let slot = match existing {
                Some(slot) => slot,
                None => {
                    let mut index = self.index.write().await;
                    // Double-check after acquiring write lock
                    let found = index
                        .active
                        .get(&diagram_id)
                        .and_then(|sid| index.sessions.get(sid))
                        .cloned();
                    match found {
                        Some(slot) => slot,
                        None => return self.create(&mut index, diagram_id, identity).await,
                    }
                }
            };

            let mut session = slot.lock().await;
            if session.is_ended() {
                // Ended between lookup and lock; the index no longer points at it.
                continue;
            }

            let now = Utc::now();
            let returning = session.participant(identity.user_id).map(|p| p.is_active());
            // A user who is already present does not take another seat
            if returning != Some(true) && session.active_count() >= self.max_active_participants {
                return Err(CollabError::PermissionDenied(format!(
                    "session {} is full",
                    session.id
                )));
            }
            let participant = match session.participant_mut(identity.user_id) {
                Some(p) => {
                    if p.is_active() {
                        p.connections += 1;
                    } else {
                        p.status = ParticipantStatus::Active;
                        p.left_at = None;
                        p.joined_at = now;
                        p.connections = 1;
                    }
                    p.display_name = identity.display_name.clone();
                    p.email = identity.email.clone();
                    p.last_activity = now;
                    p.clone()
                }
                None => {
                    let mut p = Participant::new(session.id, identity, ParticipantRole::Editor);
                    p.connections = 1;
                    session.participants.push(p.clone());
                    p
                }
            };
            session.emptied_at = None;
            self.persist(&session).await?;

            log::info!(
                "{} ({}) joined session {} as {}",
                participant.display_name,
                participant.user_id,
                session.id,
                participant.role.as_str()
            );
            return Ok(Joined {
                session: session.clone(),
                participant,
                created: false,
            });
        }
    }

    async fn create(&self, index: &mut Index, diagram_id: Uuid, identity: &UserIdentity) -> CollabResult<Joined> {
        let mut session = Session::new(diagram_id, identity.user_id);
        let mut participant = Participant::new(session.id, identity, ParticipantRole::Host);
        participant.connections = 1;
        session.participants.push(participant.clone());

        self.persist(&session).await?;
        self.log.open_session(session.id).await;
        index.active.insert(diagram_id, session.id);
        index
            .sessions
            .insert(session.id, Arc::new(Mutex::new(session.clone())));

        log::info!(
            "Session {} created for diagram {diagram_id} by {}",
            session.id,
            identity.display_name
        );
        Ok(Joined {
            session,
            participant,
            created: true,
        })
    }

    /// Close one of the participant's connections. When it was the last one
    /// they are marked `LEFT` and every lock they hold is released.
    ///
    /// Returns `None` while the user still has another connection open, or
    /// when they had already left.
    pub async fn leave(&self, session_id: Uuid, user_id: Uuid) -> CollabResult<Option<Vec<ElementLock>>> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.lock().await;
        if session.is_ended() {
            return Err(CollabError::SessionClosed(session_id));
        }

        let now = Utc::now();
        let participant = session
            .participant_mut(user_id)
            .ok_or_else(|| CollabError::NotFound(format!("participant {user_id}")))?;
        if !participant.is_active() {
            return Ok(None);
        }
        participant.connections = participant.connections.saturating_sub(1);
        if participant.connections > 0 {
            log::debug!(
                "User {user_id} still has {} connections in session {session_id}",
                participant.connections
            );
            return Ok(None);
        }
        participant.status = ParticipantStatus::Left;
        participant.left_at = Some(now);

        if session.active_count() == 0 {
            session.emptied_at = Some(now);
        }
        let diagram_id = session.diagram_id;
        let persisted = self.persist(&session).await;
        drop(session);

        // Locks go even if the roster write failed
        let released = self.locks.release_held_by(diagram_id, user_id).await;
        log::info!(
            "User {user_id} left session {session_id}, released {} locks",
            released.len()
        );
        persisted.map(|_| Some(released))
    }

    /// End the session and release all its locks. Ending twice is a no-op.
    pub async fn end(&self, session_id: Uuid) -> CollabResult<Vec<ElementLock>> {
        Ok(self.end_if(session_id, |_| true).await?.unwrap_or_default())
    }

    /// End the session if `should_end` still holds once nothing else can
    /// touch it. Returns the released locks, or `None` when the session was
    /// left running or had already ended.
    ///
    /// Lock order is diagram guard, then index, then session. Holding the
    /// guard across the status change keeps in-flight edits and lock
    /// requests from landing after the release.
    async fn end_if<F>(&self, session_id: Uuid, should_end: F) -> CollabResult<Option<Vec<ElementLock>>>
    where
        F: FnOnce(&Session) -> bool,
    {
        let slot = match self.slot(session_id).await {
            Ok(slot) => slot,
            Err(CollabError::SessionClosed(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let diagram_id = slot.lock().await.diagram_id;

        let mut guard = self.locks.lock_diagram(diagram_id).await;
        let mut index = self.index.write().await;
        let mut session = slot.lock().await;
        if session.is_ended() || !should_end(&*session) {
            return Ok(None);
        }

        let now = Utc::now();
        session.status = SessionStatus::Ended;
        session.ended_at = Some(now);
        for p in &mut session.participants {
            if p.is_active() {
                p.status = ParticipantStatus::Left;
                p.left_at = Some(now);
                p.connections = 0;
            }
        }
        if index.active.get(&diagram_id) == Some(&session_id) {
            index.active.remove(&diagram_id);
        }
        index.sessions.remove(&session_id);
        index.ended.insert(session_id);
        drop(index);

        let persisted = self.persist(&session).await;
        drop(session);

        self.log.close_session(session_id).await;
        let released = guard.release_all();
        drop(guard);
        log::info!("Session {session_id} ended, released {} locks", released.len());
        persisted.map(|_| Some(released))
    }

    /// End every active session that has had nobody in it for longer than `grace`.
    pub async fn end_idle(&self, grace: Duration) -> Vec<Uuid> {
        let cutoff = Utc::now() - grace;
        let candidates: Vec<(Uuid, SessionSlot)> = {
            let index = self.index.read().await;
            index
                .active
                .values()
                .filter_map(|sid| index.sessions.get(sid).map(|s| (*sid, s.clone())))
                .collect()
        };

        let mut ended = Vec::new();
        for (sid, slot) in candidates {
            if !is_idle(&*slot.lock().await, cutoff) {
                continue;
            }
            // Someone may rejoin before the end takes hold
            match self.end_if(sid, |s| is_idle(s, cutoff)).await {
                Ok(Some(_)) => ended.push(sid),
                Ok(None) => log::debug!("Session {sid} was rejoined before it could be reaped"),
                Err(e) => log::error!("Failed to end idle session {sid}: {e}"),
            }
        }
        if !ended.is_empty() {
            log::info!("Ended {} idle sessions", ended.len());
        }
        ended
    }

    /// Record activity from a participant.
    pub async fn touch(&self, session_id: Uuid, user_id: Uuid) -> CollabResult<()> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.lock().await;
        if session.is_ended() {
            return Err(CollabError::SessionClosed(session_id));
        }
        let p = session
            .participant_mut(user_id)
            .ok_or_else(|| CollabError::NotFound(format!("participant {user_id}")))?;
        p.last_activity = Utc::now();
        Ok(())
    }

    /// Change a participant's role. Only the host may do this, and the host
    /// role itself is not transferable. Demotion releases the target's locks.
    pub async fn set_role(
        &self,
        session_id: Uuid,
        actor: Uuid,
        target: Uuid,
        role: ParticipantRole,
    ) -> CollabResult<(Participant, Vec<ElementLock>)> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.lock().await;
        if session.is_ended() {
            return Err(CollabError::SessionClosed(session_id));
        }

        let actor_role = session
            .participant(actor)
            .map(|p| p.role)
            .ok_or_else(|| CollabError::NotFound(format!("participant {actor}")))?;
        if actor_role != ParticipantRole::Host {
            return Err(CollabError::PermissionDenied("only the host may change roles".into()));
        }
        if role == ParticipantRole::Host {
            return Err(CollabError::PermissionDenied("the host role cannot be assigned".into()));
        }

        let p = session
            .participant_mut(target)
            .ok_or_else(|| CollabError::NotFound(format!("participant {target}")))?;
        if p.role == ParticipantRole::Host {
            return Err(CollabError::PermissionDenied("the host role cannot be changed".into()));
        }
        p.role = role;
        let updated = p.clone();

        let diagram_id = session.diagram_id;
        self.persist(&session).await?;
        drop(session);

        let released = if role.can_edit() {
            Vec::new()
        } else {
            self.locks.release_held_by(diagram_id, target).await
        };
        log::info!("User {target} is now {} in session {session_id}", role.as_str());
        Ok((updated, released))
    }

    /// Live sessions come from memory, ended ones from the store.
    pub async fn session(&self, session_id: Uuid) -> CollabResult<Session> {
        match self.slot(session_id).await {
            Ok(slot) => Ok(slot.lock().await.clone()),
            Err(CollabError::SessionClosed(_)) | Err(CollabError::NotFound(_)) => {
                self.archived(session_id).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn active_session(&self, diagram_id: Uuid) -> Option<Session> {
        let slot = {
            let index = self.index.read().await;
            index
                .active
                .get(&diagram_id)
                .and_then(|sid| index.sessions.get(sid))
                .cloned()
        }?;
        let session = slot.lock().await.clone();
        Some(session)
    }

    /// Participants in join order.
    pub async fn roster(&self, session_id: Uuid) -> CollabResult<Vec<Participant>> {
        Ok(self.session(session_id).await?.participants)
    }

    pub async fn participant(&self, session_id: Uuid, user_id: Uuid) -> CollabResult<Participant> {
        self.session(session_id)
            .await?
            .participant(user_id)
            .cloned()
            .ok_or_else(|| CollabError::NotFound(format!("participant {user_id}")))
    }

    /// The participant, provided the session is live and they have not left.
    pub async fn active_participant(&self, session_id: Uuid, user_id: Uuid) -> CollabResult<Participant> {
        let slot = self.slot(session_id).await?;
        let session = slot.lock().await;
        if session.is_ended() {
            return Err(CollabError::SessionClosed(session_id));
        }
        match session.participant(user_id) {
            Some(p) if p.is_active() => Ok(p.clone()),
            _ => Err(CollabError::NotFound(format!("active participant {user_id}"))),
        }
    }

    pub async fn stats(&self, session_id: Uuid) -> CollabResult<SessionStats> {
        let session = self.session(session_id).await?;

        let mut by_role = HashMap::new();
        for p in &session.participants {
            *by_role.entry(p.role).or_insert(0) += 1;
        }
        let events_by_type = self.log.type_counts(session_id).await?;
        let current_sequence = self.log.current_sequence(session_id).await;
        let active_locks = if session.is_ended() {
            0
        } else {
            self.locks.active_locks(session.diagram_id).await.len()
        };
        let end = session.ended_at.unwrap_or_else(Utc::now);

        Ok(SessionStats {
            session_id,
            diagram_id: session.diagram_id,
            status: session.status,
            participants_total: session.participants.len(),
            participants_active: session.active_count(),
            participants_by_role: by_role,
            events_total: current_sequence,
            events_by_type,
            current_sequence,
            active_locks,
            created_at: session.created_at,
            ended_at: session.ended_at,
            duration_secs: (end - session.created_at).num_seconds(),
        })
    }

    pub async fn active_session_count(&self) -> usize {
        self.index.read().await.active.len()
    }

    /// Sessions held in memory. Ended ones are not among them.
    pub async fn resident_session_count(&self) -> usize {
        self.index.read().await.sessions.len()
    }
}

fn is_idle(session: &Session, cutoff: DateTime<Utc>) -> bool {
    session.active_count() == 0 && session.emptied_at.is_some_and(|t| t < cutoff)
}
