//! Core data model: sessions, participants, element locks and change events.
//!
//! Ownership:
//! - `Session` / `Participant` — owned by the session registry
//! - `ElementLock`             — owned by the lock table
//! - `ChangeEvent`             — owned by the change log
//!
//! Other components only ever see clones handed out through those owners.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity supplied by the user-identity provider for an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub display_name: String,
    pub email: String,
}

impl UserIdentity {
    pub fn new(user_id: Uuid, display_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            email: email.into(),
        }
    }

    /// Identity with a generated id (for testing).
    pub fn named(display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        let email = format!("{}@example.com", display_name.to_lowercase());
        Self::new(Uuid::new_v4(), display_name, email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    /// Never entered by the server itself; stored records written by
    /// external tooling may carry it and are treated like `Active`.
    Paused,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    Host,
    Editor,
    Viewer,
    Commenter,
}

impl ParticipantRole {
    /// Whether this role may hold locks and append change events.
    pub fn can_edit(self) -> bool {
        matches!(self, Self::Host | Self::Editor)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "HOST",
            Self::Editor => "EDITOR",
            Self::Viewer => "VIEWER",
            Self::Commenter => "COMMENTER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Active,
    Left,
}

/// A (session, user) membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub email: String,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    /// Open connections for this user. Live state only: never stored or sent.
    #[serde(skip)]
    pub connections: u32,
}

impl Participant {
    pub fn new(session_id: Uuid, identity: &UserIdentity, role: ParticipantRole) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            email: identity.email.clone(),
            role,
            status: ParticipantStatus::Active,
            joined_at: now,
            left_at: None,
            last_activity: now,
            connections: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }
}

/// One collaborative room bound to exactly one diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub diagram_id: Uuid,
    pub host_user: Uuid,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Roster in join order.
    pub participants: Vec<Participant>,
    /// When the last active participant left (None while anyone is active).
    pub emptied_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(diagram_id: Uuid, host_user: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            diagram_id,
            host_user,
            status: SessionStatus::Active,
            created_at: Utc::now(),
            ended_at: None,
            participants: Vec::new(),
            emptied_at: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }

    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: Uuid) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn active_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_active()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockKind {
    #[default]
    Element,
    Attribute,
    Relationship,
    Section,
}

/// A lease granting exclusive write access to one element (or sub-path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementLock {
    pub id: Uuid,
    pub session_id: Uuid,
    pub diagram_id: Uuid,
    pub element_id: String,
    /// Empty string for a whole-element lock.
    pub element_path: String,
    pub kind: LockKind,
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl ElementLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Active and not yet expired.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired_at(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ElementCreated,
    #[default]
    ElementUpdated,
    ElementDeleted,
    ElementMoved,
    RelationshipCreated,
    RelationshipUpdated,
    RelationshipDeleted,
    AttributeAdded,
    AttributeUpdated,
    AttributeRemoved,
    MethodAdded,
    MethodUpdated,
    MethodRemoved,
    DiagramSaved,
}

/// One accepted edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub session_id: Uuid,
    pub diagram_id: Uuid,
    pub author: Uuid,
    pub event_type: EventType,
    pub element_id: String,
    pub element_type: String,
    pub change_data: Value,
    /// State before the change, kept for undo.
    pub previous_data: Option<Value>,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub conflict_resolved: bool,
    pub broadcast_count: u32,
}

impl ChangeEvent {
    fn has_previous_data(&self) -> bool {
        match &self.previous_data {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(_) => true,
        }
    }

    /// Undo eligibility: same author, has a previous payload, not flagged as
    /// conflict-resolved, and still inside the undo window.
    pub fn can_undo(&self, user_id: Uuid, now: DateTime<Utc>, window: Duration) -> bool {
        self.author == user_id
            && self.has_previous_data()
            && !self.conflict_resolved
            && now - self.timestamp < window
    }
}

/// An edit as submitted, before the resolver decides its fate.
#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub event_type: EventType,
    pub element_id: String,
    pub element_type: String,
    pub change_data: Value,
    pub previous_data: Option<Value>,
    /// Highest sequence the client had seen when it issued the edit.
    pub observed_sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(author: Uuid, previous: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            diagram_id: Uuid::new_v4(),
            author,
            event_type: EventType::ElementUpdated,
            element_id: "e1".into(),
            element_type: "class".into(),
            change_data: json!({"name": "Order"}),
            previous_data: previous,
            sequence_number: 1,
            timestamp: Utc::now(),
            conflict_resolved: false,
            broadcast_count: 0,
        }
    }

    #[test]
    fn test_role_edit_rights() {
        assert!(ParticipantRole::Host.can_edit());
        assert!(ParticipantRole::Editor.can_edit());
        assert!(!ParticipantRole::Viewer.can_edit());
        assert!(!ParticipantRole::Commenter.can_edit());
    }

    #[test]
    fn test_lock_liveness() {
        let now = Utc::now();
        let lock = ElementLock {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            diagram_id: Uuid::new_v4(),
            element_id: "e1".into(),
            element_path: String::new(),
            kind: LockKind::Element,
            holder: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + Duration::minutes(5),
            active: true,
        };
        assert!(lock.is_live_at(now));
        assert!(!lock.is_live_at(now + Duration::minutes(6)));

        let released = ElementLock { active: false, ..lock };
        assert!(!released.is_live_at(now));
    }

    #[test]
    fn test_undo_eligibility() {
        let author = Uuid::new_v4();
        let now = Utc::now();
        let window = Duration::hours(1);

        let ev = event(author, Some(json!({"name": "Old"})));
        assert!(ev.can_undo(author, now, window));
        assert!(!ev.can_undo(Uuid::new_v4(), now, window));
        assert!(!ev.can_undo(author, now + Duration::minutes(61), window));

        let flagged = ChangeEvent { conflict_resolved: true, ..ev.clone() };
        assert!(!flagged.can_undo(author, now, window));

        assert!(!event(author, None).can_undo(author, now, window));
        assert!(!event(author, Some(json!({}))).can_undo(author, now, window));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_value(EventType::ElementCreated).unwrap(), json!("ELEMENT_CREATED"));
        assert_eq!(serde_json::to_value(LockKind::Relationship).unwrap(), json!("RELATIONSHIP"));
        assert_eq!(serde_json::to_value(ParticipantRole::Commenter).unwrap(), json!("COMMENTER"));
        assert_eq!(serde_json::to_value(SessionStatus::Ended).unwrap(), json!("ENDED"));
    }

    #[test]
    fn test_session_roster_lookup() {
        let host = UserIdentity::named("Alice");
        let mut session = Session::new(Uuid::new_v4(), host.user_id);
        session.participants.push(Participant::new(session.id, &host, ParticipantRole::Host));
        assert_eq!(session.active_count(), 1);
        assert!(session.participant(host.user_id).is_some());
        assert!(session.participant(Uuid::new_v4()).is_none());
    }
}
