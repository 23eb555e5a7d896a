//! Edit admission policy.
//!
//! Order of checks for an incoming edit:
//! 1. role: `VIEWER` / `COMMENTER` are refused with `PermissionDenied`
//! 2. lock: a live lock on the element held by someone else refuses with
//!    `ElementLocked { holder }`
//! 3. accept: append to the change log exactly as submitted
//!
//! Steps 2 and 3 run inside the diagram's lock-table critical section, so a
//! lock committed by another participant is either seen by the check or
//! acquired after the append. Unlocked concurrent edits are last-committed-wins.
//!
//! Ending a session holds the same critical section, so the session is
//! rechecked under it. A request that raced the end gets `SessionClosed`.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::changelog::ChangeLog;
use crate::error::{CollabError, CollabResult};
use crate::locks::{Acquired, LockRequest, LockTable};
use crate::model::{ChangeEvent, EditRequest, Participant};

pub struct ConflictResolver {
    locks: Arc<LockTable>,
    log: Arc<ChangeLog>,
    undo_window: Duration,
}

impl ConflictResolver {
    pub fn new(locks: Arc<LockTable>, log: Arc<ChangeLog>, undo_window: Duration) -> Self {
        Self {
            locks,
            log,
            undo_window,
        }
    }

    fn require_editor(participant: &Participant, action: &str) -> CollabResult<()> {
        if participant.role.can_edit() {
            Ok(())
        } else {
            Err(CollabError::PermissionDenied(format!(
                "{} may not {action}",
                participant.role.as_str()
            )))
        }
    }

    async fn require_open(&self, participant: &Participant) -> CollabResult<()> {
        if self.log.is_open(participant.session_id).await {
            Ok(())
        } else {
            Err(CollabError::SessionClosed(participant.session_id))
        }
    }

    /// Decide the fate of one edit and append it on acceptance.
    pub async fn submit(
        &self,
        diagram_id: Uuid,
        participant: &Participant,
        edit: EditRequest,
    ) -> CollabResult<ChangeEvent> {
        self.submit_then(diagram_id, participant, edit, |_| {}).await
    }

    /// Like `submit`, running `on_commit` before the diagram critical section
    /// is left. Publishing from `on_commit` keeps fan-out in sequence order.
    pub async fn submit_then<F>(
        &self,
        diagram_id: Uuid,
        participant: &Participant,
        edit: EditRequest,
        on_commit: F,
    ) -> CollabResult<ChangeEvent>
    where
        F: FnOnce(&ChangeEvent) + Send,
    {
        Self::require_editor(participant, "edit")?;

        let guard = self.locks.lock_diagram(diagram_id).await;
        self.require_open(participant).await?;
        if let Some(holder) = guard.blocking_holder(&edit.element_id, participant.user_id) {
            log::debug!(
                "Edit on {} by {} refused: locked by {holder}",
                edit.element_id,
                participant.user_id
            );
            return Err(CollabError::ElementLocked {
                element_id: edit.element_id,
                holder,
            });
        }

        let event = self
            .log
            .append(participant.session_id, diagram_id, participant.user_id, edit)
            .await?;
        on_commit(&event);
        drop(guard);

        if event.conflict_resolved {
            log::info!(
                "Event #{} on {} committed over a concurrent edit",
                event.sequence_number,
                event.element_id
            );
        }
        Ok(event)
    }

    /// Acquire (or renew) a lock on behalf of a participant.
    pub async fn acquire_lock(
        &self,
        diagram_id: Uuid,
        participant: &Participant,
        request: LockRequest,
    ) -> CollabResult<Acquired> {
        self.acquire_lock_then(diagram_id, participant, request, |_| {}).await
    }

    pub async fn acquire_lock_then<F>(
        &self,
        diagram_id: Uuid,
        participant: &Participant,
        request: LockRequest,
        on_commit: F,
    ) -> CollabResult<Acquired>
    where
        F: FnOnce(&Acquired) + Send,
    {
        Self::require_editor(participant, "hold locks")?;
        let mut guard = self.locks.lock_diagram(diagram_id).await;
        self.require_open(participant).await?;
        let acquired = guard.acquire(request);
        on_commit(&acquired);
        Ok(acquired)
    }

    /// Append a compensating event that restores an earlier event's previous payload.
    ///
    /// Eligible only for the author, within the undo window, when the
    /// event carries a previous payload and was not flagged as a conflict.
    pub async fn undo(
        &self,
        diagram_id: Uuid,
        participant: &Participant,
        event_id: Uuid,
    ) -> CollabResult<ChangeEvent> {
        self.undo_then(diagram_id, participant, event_id, |_| {}).await
    }

    pub async fn undo_then<F>(
        &self,
        diagram_id: Uuid,
        participant: &Participant,
        event_id: Uuid,
        on_commit: F,
    ) -> CollabResult<ChangeEvent>
    where
        F: FnOnce(&ChangeEvent) + Send,
    {
        let original = self.log.event(participant.session_id, event_id).await?;
        if !original.can_undo(participant.user_id, Utc::now(), self.undo_window) {
            return Err(CollabError::PermissionDenied(format!(
                "event {event_id} cannot be undone"
            )));
        }

        let Some(previous) = original.previous_data.clone() else {
            return Err(CollabError::PermissionDenied(format!(
                "event {event_id} has no previous state"
            )));
        };

        let compensating = EditRequest {
            event_type: original.event_type,
            element_id: original.element_id,
            element_type: original.element_type,
            change_data: previous,
            previous_data: Some(original.change_data),
            observed_sequence: self.log.current_sequence(participant.session_id).await,
        };
        self.submit_then(diagram_id, participant, compensating, on_commit).await
    }
}
