//! Append-only, per-session ordered record of accepted edits.
//!
//! Each session owns a `Mutex<Vec<ChangeEvent>>`; the vector index is always
//! `sequence_number - 1`, so sequences are gapless by construction and
//! `since(n)` is a slice. Appends for one session are serialized by that
//! mutex. Different sessions never contend.
//!
//! When an `EventStore` is attached the event is written to RocksDB before it
//! becomes visible in memory. A failed write leaves the log untouched.
//!
//! Only live sessions are held in memory. `close_session` drops an ended
//! session's vector; later reads of it are served from the store.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::model::{ChangeEvent, EditRequest, EventType};
use crate::storage::{EventStore, StoreError};

/// Buffered appends per `subscribe()` receiver.
const APPEND_STREAM_CAPACITY: usize = 1024;

type SessionLog = Arc<Mutex<Vec<ChangeEvent>>>;

pub struct ChangeLog {
    sessions: RwLock<HashMap<Uuid, SessionLog>>,
    store: Option<Arc<EventStore>>,
    appended: broadcast::Sender<ChangeEvent>,
}

impl ChangeLog {
    pub fn new(store: Option<Arc<EventStore>>) -> Self {
        let (appended, _) = broadcast::channel(APPEND_STREAM_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            appended,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Start an empty log for a session. No-op if it already exists.
    pub async fn open_session(&self, session_id: Uuid) {
        self.sessions
            .write()
            .await
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
    }

    /// Install events loaded from storage. They must already be gapless from 1.
    pub async fn restore(&self, session_id: Uuid, mut events: Vec<ChangeEvent>) -> CollabResult<()> {
        events.sort_by_key(|e| e.sequence_number);
        for (i, event) in events.iter().enumerate() {
            if event.sequence_number != i as u64 + 1 {
                return Err(CollabError::InternalFailure(format!(
                    "stored log for session {session_id} has a gap at sequence {}",
                    i + 1
                )));
            }
        }
        self.sessions
            .write()
            .await
            .insert(session_id, Arc::new(Mutex::new(events)));
        Ok(())
    }

    /// Drop a session's log from memory. Appends to it fail from now on.
    pub async fn close_session(&self, session_id: Uuid) -> bool {
        self.sessions.write().await.remove(&session_id).is_some()
    }

    /// Whether the session's log is in memory and accepting appends.
    pub async fn is_open(&self, session_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    /// Events after `after` for a session that is not in memory, read from
    /// the store. A session the store has no record of is `NotFound`.
    async fn archived(&self, session_id: Uuid, after: u64) -> CollabResult<Vec<ChangeEvent>> {
        let missing = || CollabError::NotFound(format!("session {session_id}"));
        let Some(store) = self.store.clone() else {
            return Err(missing());
        };
        let loaded = tokio::task::spawn_blocking(move || match store.load_session(session_id) {
            Ok(_) => store.load_events_since(session_id, after).map(Some),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        })
        .await
        .map_err(|e| CollabError::InternalFailure(e.to_string()))??;
        loaded.ok_or_else(missing)
    }

    async fn log(&self, session_id: Uuid) -> CollabResult<SessionLog> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| CollabError::NotFound(format!("session {session_id}")))
    }

    /// Assign the next sequence number and persist the event.
    ///
    /// `conflict_resolved` is set when the log already holds an event for
    /// the same element with a sequence above `edit.observed_sequence`.
    pub async fn append(
        &self,
        session_id: Uuid,
        diagram_id: Uuid,
        author: Uuid,
        edit: EditRequest,
    ) -> CollabResult<ChangeEvent> {
        let log = self.log(session_id).await?;
        let mut events = log.lock().await;

        let observed = (edit.observed_sequence as usize).min(events.len());
        let conflict_resolved = events[observed..]
            .iter()
            .any(|e| e.element_id == edit.element_id);

        let event = ChangeEvent {
            id: Uuid::new_v4(),
            session_id,
            diagram_id,
            author,
            event_type: edit.event_type,
            element_id: edit.element_id,
            element_type: edit.element_type,
            change_data: edit.change_data,
            previous_data: edit.previous_data,
            sequence_number: events.len() as u64 + 1,
            timestamp: Utc::now(),
            conflict_resolved,
            broadcast_count: 0,
        };

        self.persist(&event).await?;
        events.push(event.clone());
        drop(events);

        log::debug!(
            "Appended {:?} on {} as #{} in session {session_id}",
            event.event_type,
            event.element_id,
            event.sequence_number
        );
        // No subscribers is fine
        let _ = self.appended.send(event.clone());
        Ok(event)
    }

    async fn persist(&self, event: &ChangeEvent) -> CollabResult<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let event = event.clone();
        let seq = event.sequence_number;
        let session_id = event.session_id;
        tokio::task::spawn_blocking(move || store.put_event(&event))
            .await
            .map_err(|e| CollabError::InternalFailure(e.to_string()))?
            .map_err(|e| {
                log::error!("Failed to persist event #{seq} for session {session_id}: {e}");
                CollabError::from(e)
            })
    }

    /// Events with sequence strictly greater than `after`, ascending.
    pub async fn since(&self, session_id: Uuid, after: u64) -> CollabResult<Vec<ChangeEvent>> {
        let Ok(log) = self.log(session_id).await else {
            return self.archived(session_id, after).await;
        };
        let events = log.lock().await;
        let start = (after as usize).min(events.len());
        Ok(events[start..].to_vec())
    }

    /// Highest assigned sequence number, 0 for an empty or unknown log.
    pub async fn current_sequence(&self, session_id: Uuid) -> u64 {
        match self.log(session_id).await {
            Ok(log) => log.lock().await.len() as u64,
            Err(_) => self
                .archived(session_id, 0)
                .await
                .ok()
                .and_then(|events| events.last().map(|e| e.sequence_number))
                .unwrap_or(0),
        }
    }

    /// The last `limit` events, ascending.
    pub async fn recent(&self, session_id: Uuid, limit: usize) -> CollabResult<Vec<ChangeEvent>> {
        let mut events = self.since(session_id, 0).await?;
        let start = events.len().saturating_sub(limit);
        Ok(events.split_off(start))
    }

    pub async fn event(&self, session_id: Uuid, event_id: Uuid) -> CollabResult<ChangeEvent> {
        let not_found = || CollabError::NotFound(format!("event {event_id}"));
        let Ok(log) = self.log(session_id).await else {
            return self
                .archived(session_id, 0)
                .await?
                .into_iter()
                .find(|e| e.id == event_id)
                .ok_or_else(not_found);
        };
        let events = log.lock().await;
        events
            .iter()
            .find(|e| e.id == event_id)
            .cloned()
            .ok_or_else(not_found)
    }

    /// Record how many connections received an event.
    pub async fn record_broadcast(&self, session_id: Uuid, sequence: u64, count: usize) -> CollabResult<()> {
        let log = self.log(session_id).await?;
        let mut events = log.lock().await;
        let idx = (sequence as usize)
            .checked_sub(1)
            .filter(|i| *i < events.len())
            .ok_or_else(|| CollabError::NotFound(format!("sequence {sequence}")))?;

        let mut updated = events[idx].clone();
        updated.broadcast_count = updated.broadcast_count.saturating_add(count as u32);
        self.persist(&updated).await?;
        events[idx] = updated;
        Ok(())
    }

    /// Counts per event type, for session statistics.
    pub async fn type_counts(&self, session_id: Uuid) -> CollabResult<HashMap<EventType, usize>> {
        let events = self.since(session_id, 0).await?;
        let mut counts = HashMap::new();
        for e in events.iter() {
            *counts.entry(e.event_type).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Stream of every appended event, across all sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.appended.subscribe()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn edit(element_id: &str, observed: u64) -> EditRequest {
        EditRequest {
            event_type: EventType::ElementUpdated,
            element_id: element_id.to_string(),
            element_type: "class".to_string(),
            change_data: json!({"name": element_id}),
            previous_data: None,
            observed_sequence: observed,
        }
    }

    async fn open_log() -> (ChangeLog, Uuid) {
        let log = ChangeLog::in_memory();
        let sid = Uuid::new_v4();
        log.open_session(sid).await;
        (log, sid)
    }

    #[tokio::test]
    async fn test_sequences_start_at_one_and_are_gapless() {
        let (log, sid) = open_log().await;
        let diagram = Uuid::new_v4();
        let author = Uuid::new_v4();

        assert_eq!(log.current_sequence(sid).await, 0);
        for expected in 1..=5 {
            let ev = log.append(sid, diagram, author, edit("e1", expected - 1)).await.unwrap();
            assert_eq!(ev.sequence_number, expected);
        }
        assert_eq!(log.current_sequence(sid).await, 5);
    }

    #[tokio::test]
    async fn test_since_is_exclusive_and_repeatable() {
        let (log, sid) = open_log().await;
        let diagram = Uuid::new_v4();
        let author = Uuid::new_v4();
        for i in 0..10 {
            log.append(sid, diagram, author, edit(&format!("e{i}"), i)).await.unwrap();
        }

        let tail = log.since(sid, 7).await.unwrap();
        let seqs: Vec<u64> = tail.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
        assert_eq!(log.since(sid, 7).await.unwrap(), tail);

        assert!(log.since(sid, 10).await.unwrap().is_empty());
        assert!(log.since(sid, 99).await.unwrap().is_empty());
        assert_eq!(log.since(sid, 0).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let log = ChangeLog::in_memory();
        let missing = Uuid::new_v4();
        assert_matches!(log.since(missing, 0).await, Err(CollabError::NotFound(_)));
        assert_matches!(
            log.append(missing, Uuid::new_v4(), Uuid::new_v4(), edit("e1", 0)).await,
            Err(CollabError::NotFound(_))
        );
        assert_eq!(log.current_sequence(missing).await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_collide() {
        let (log, sid) = open_log().await;
        let log = Arc::new(log);
        let diagram = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..32 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(sid, diagram, Uuid::new_v4(), edit(&format!("e{i}"), 0))
                    .await
                    .unwrap()
                    .sequence_number
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=32).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_conflict_flag_on_intervening_same_element_edit() {
        let (log, sid) = open_log().await;
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        // Both observed sequence 0
        let first = log.append(sid, diagram, alice, edit("e1", 0)).await.unwrap();
        let second = log.append(sid, diagram, bob, edit("e1", 0)).await.unwrap();
        assert!(!first.conflict_resolved);
        assert!(second.conflict_resolved);

        // Different element, stale view: no conflict
        let other = log.append(sid, diagram, bob, edit("e2", 0)).await.unwrap();
        assert!(!other.conflict_resolved);

        // Up-to-date view: no conflict
        let fresh = log.append(sid, diagram, alice, edit("e1", 3)).await.unwrap();
        assert!(!fresh.conflict_resolved);
    }

    #[tokio::test]
    async fn test_recent_tail() {
        let (log, sid) = open_log().await;
        let diagram = Uuid::new_v4();
        let author = Uuid::new_v4();
        for i in 0..5 {
            log.append(sid, diagram, author, edit("e1", i)).await.unwrap();
        }
        let recent = log.recent(sid, 2).await.unwrap();
        assert_eq!(recent.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(log.recent(sid, 100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_record_broadcast() {
        let (log, sid) = open_log().await;
        let ev = log.append(sid, Uuid::new_v4(), Uuid::new_v4(), edit("e1", 0)).await.unwrap();

        log.record_broadcast(sid, ev.sequence_number, 3).await.unwrap();
        let stored = log.event(sid, ev.id).await.unwrap();
        assert_eq!(stored.broadcast_count, 3);

        assert_matches!(log.record_broadcast(sid, 0, 1).await, Err(CollabError::NotFound(_)));
        assert_matches!(log.record_broadcast(sid, 9, 1).await, Err(CollabError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_subscribe_sees_appends() {
        let (log, sid) = open_log().await;
        let mut rx = log.subscribe();
        let ev = log.append(sid, Uuid::new_v4(), Uuid::new_v4(), edit("e1", 0)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, ev.id);
    }

    #[tokio::test]
    async fn test_type_counts() {
        let (log, sid) = open_log().await;
        let diagram = Uuid::new_v4();
        let author = Uuid::new_v4();
        log.append(sid, diagram, author, edit("e1", 0)).await.unwrap();
        let mut created = edit("e2", 1);
        created.event_type = EventType::ElementCreated;
        log.append(sid, diagram, author, created).await.unwrap();

        let counts = log.type_counts(sid).await.unwrap();
        assert_eq!(counts[&EventType::ElementUpdated], 1);
        assert_eq!(counts[&EventType::ElementCreated], 1);
    }

    #[tokio::test]
    async fn test_appends_are_persisted_and_restorable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let log = ChangeLog::new(Some(store.clone()));
        let sid = Uuid::new_v4();
        log.open_session(sid).await;

        let diagram = Uuid::new_v4();
        let author = Uuid::new_v4();
        for i in 0..3 {
            log.append(sid, diagram, author, edit("e1", i)).await.unwrap();
        }

        let fresh = ChangeLog::new(Some(store.clone()));
        fresh.restore(sid, store.load_all_events(sid).unwrap()).await.unwrap();
        assert_eq!(fresh.current_sequence(sid).await, 3);
        let next = fresh.append(sid, diagram, author, edit("e1", 3)).await.unwrap();
        assert_eq!(next.sequence_number, 4);
    }

    #[tokio::test]
    async fn test_closed_log_rejects_appends() {
        let (log, sid) = open_log().await;
        let diagram = Uuid::new_v4();
        let author = Uuid::new_v4();
        log.append(sid, diagram, author, edit("e1", 0)).await.unwrap();

        assert!(log.is_open(sid).await);
        assert!(log.close_session(sid).await);
        assert!(!log.is_open(sid).await);
        assert_eq!(log.session_count().await, 0);

        assert_matches!(
            log.append(sid, diagram, author, edit("e1", 1)).await,
            Err(CollabError::NotFound(_))
        );
        // Nothing to fall back to without a store
        assert_matches!(log.since(sid, 0).await, Err(CollabError::NotFound(_)));
        assert!(!log.close_session(sid).await);
    }

    #[tokio::test]
    async fn test_closed_log_reads_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let log = ChangeLog::new(Some(store.clone()));

        let diagram = Uuid::new_v4();
        let author = Uuid::new_v4();
        let session = crate::model::Session::new(diagram, author);
        let sid = session.id;
        store.save_session(&session).unwrap();
        log.open_session(sid).await;

        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(log.append(sid, diagram, author, edit(&format!("e{i}"), i)).await.unwrap().id);
        }
        log.close_session(sid).await;

        let tail = log.since(sid, 2).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(log.current_sequence(sid).await, 4);
        assert_eq!(log.recent(sid, 1).await.unwrap()[0].sequence_number, 4);
        assert_eq!(log.event(sid, ids[1]).await.unwrap().element_id, "e1");
        assert_eq!(log.type_counts(sid).await.unwrap()[&EventType::ElementUpdated], 4);

        // Unknown to the store as well
        assert_matches!(log.since(Uuid::new_v4(), 0).await, Err(CollabError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restore_rejects_gaps() {
        let (log, sid) = open_log().await;
        let ev = log.append(sid, Uuid::new_v4(), Uuid::new_v4(), edit("e1", 0)).await.unwrap();
        let gapped = ChangeEvent { sequence_number: 2, ..ev };
        assert_matches!(
            log.restore(Uuid::new_v4(), vec![gapped]).await,
            Err(CollabError::InternalFailure(_))
        );
    }
}
