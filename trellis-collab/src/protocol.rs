//! JSON wire protocol between clients and a session room.
//!
//! Every frame is a text frame holding one JSON object with a `type`
//! discriminator:
//! ```text
//! {"type": "acquire_lock", "element_id": "class-42", "duration_minutes": 10}
//! ```
//!
//! Inbound decoding is two-step: the frame is parsed as a JSON value first so
//! that a missing or unknown `type` is reported distinctly from a known type
//! with bad fields. Both end up as `MalformedMessage`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::model::{
    ChangeEvent, EditRequest, ElementLock, EventType, LockKind, Participant, ParticipantRole,
};

/// Inbound `type` values understood by the gateway.
pub const INBOUND_TYPES: &[&str] = &[
    "diagram_change",
    "acquire_lock",
    "release_lock",
    "sync_request",
    "cursor_update",
    "undo",
    "set_role",
    "ping",
    "leave",
];

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    DiagramChange {
        element_id: String,
        element_type: String,
        event_type: EventType,
        change_data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_data: Option<Value>,
        /// Highest sequence the client had applied; defaults to the log head at receipt.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        observed_sequence: Option<u64>,
    },
    AcquireLock {
        element_id: String,
        #[serde(default)]
        element_path: String,
        #[serde(default)]
        lock_type: LockKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_minutes: Option<i64>,
    },
    ReleaseLock {
        element_id: String,
        #[serde(default)]
        element_path: String,
    },
    SyncRequest {
        last_sequence_number: u64,
    },
    CursorUpdate {
        #[serde(default)]
        cursor_data: Value,
    },
    Undo {
        event_id: Uuid,
    },
    SetRole {
        user_id: Uuid,
        role: ParticipantRole,
    },
    Ping,
    Leave,
}

impl ClientMessage {
    /// Decode one text frame.
    pub fn decode(text: &str) -> CollabResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CollabError::MalformedMessage(format!("invalid JSON: {e}")))?;

        let msg_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CollabError::MalformedMessage("missing message type".into()))?;

        if !INBOUND_TYPES.contains(&msg_type) {
            return Err(CollabError::MalformedMessage(format!(
                "Unknown message type: {msg_type}"
            )));
        }

        serde_json::from_value(value).map_err(|e| CollabError::MalformedMessage(e.to_string()))
    }

    pub fn encode(&self) -> CollabResult<String> {
        serde_json::to_string(self).map_err(|e| CollabError::InternalFailure(e.to_string()))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DiagramChange { .. } => "diagram_change",
            Self::AcquireLock { .. } => "acquire_lock",
            Self::ReleaseLock { .. } => "release_lock",
            Self::SyncRequest { .. } => "sync_request",
            Self::CursorUpdate { .. } => "cursor_update",
            Self::Undo { .. } => "undo",
            Self::SetRole { .. } => "set_role",
            Self::Ping => "ping",
            Self::Leave => "leave",
        }
    }

    /// Build an edit from a `diagram_change`; `head` fills a missing observed sequence.
    pub fn into_edit(self, head: u64) -> Option<EditRequest> {
        match self {
            Self::DiagramChange {
                element_id,
                element_type,
                event_type,
                change_data,
                previous_data,
                observed_sequence,
            } => Some(EditRequest {
                event_type,
                element_id,
                element_type,
                change_data,
                previous_data,
                observed_sequence: observed_sequence.unwrap_or(head),
            }),
            _ => None,
        }
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Snapshot sent once, right after a successful join.
    SessionState {
        session_id: Uuid,
        diagram_id: Uuid,
        participant: Participant,
        participants: Vec<Participant>,
        recent_events: Vec<ChangeEvent>,
        active_locks: Vec<ElementLock>,
        current_sequence: u64,
    },
    DiagramChange {
        change_event: ChangeEvent,
    },
    LockAcquired {
        element_id: String,
        element_path: String,
        lock_id: Uuid,
        lock_type: LockKind,
        holder: Uuid,
        expires_at: DateTime<Utc>,
    },
    LockReleased {
        element_id: String,
        element_path: String,
        holder: Uuid,
    },
    SyncResponse {
        events: Vec<ChangeEvent>,
        current_sequence: u64,
    },
    UserJoined {
        participant: Participant,
    },
    UserLeft {
        user_id: Uuid,
        display_name: String,
    },
    RoleChanged {
        participant: Participant,
    },
    CursorUpdate {
        user_id: Uuid,
        cursor_data: Value,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<Uuid>,
    },
}

impl ServerMessage {
    pub fn error(err: &CollabError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            holder: err.holder(),
        }
    }

    pub fn lock_acquired(lock: &ElementLock) -> Self {
        Self::LockAcquired {
            element_id: lock.element_id.clone(),
            element_path: lock.element_path.clone(),
            lock_id: lock.id,
            lock_type: lock.kind,
            holder: lock.holder,
            expires_at: lock.expires_at,
        }
    }

    pub fn lock_released(lock: &ElementLock) -> Self {
        Self::LockReleased {
            element_id: lock.element_id.clone(),
            element_path: lock.element_path.clone(),
            holder: lock.holder,
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> CollabResult<String> {
        serde_json::to_string(self).map_err(|e| CollabError::InternalFailure(e.to_string()))
    }

    pub fn decode(text: &str) -> CollabResult<Self> {
        serde_json::from_str(text).map_err(CollabError::from)
    }

    /// Cursor echoes skip the connection that sent them.
    pub fn excludes_origin(&self) -> bool {
        matches!(self, Self::CursorUpdate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_decode_diagram_change() {
        let msg = ClientMessage::decode(
            r#"{"type":"diagram_change","element_id":"e1","element_type":"class",
                "event_type":"ELEMENT_UPDATED","change_data":{"name":"Order"}}"#,
        )
        .unwrap();
        let edit = msg.into_edit(7).unwrap();
        assert_eq!(edit.element_id, "e1");
        assert_eq!(edit.event_type, EventType::ElementUpdated);
        assert_eq!(edit.observed_sequence, 7);
        assert!(edit.previous_data.is_none());
    }

    #[test]
    fn test_decode_lock_defaults() {
        let msg = ClientMessage::decode(r#"{"type":"acquire_lock","element_id":"e1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::AcquireLock {
                element_id: "e1".into(),
                element_path: String::new(),
                lock_type: LockKind::Element,
                duration_minutes: None,
            }
        );
    }

    #[test]
    fn test_decode_unit_variants() {
        assert_eq!(ClientMessage::decode(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(ClientMessage::decode(r#"{"type":"leave"}"#).unwrap(), ClientMessage::Leave);
    }

    #[test]
    fn test_decode_failures_are_malformed() {
        let cases = [
            "not json",
            r#"[1,2,3]"#,
            r#"{"element_id":"e1"}"#,
            r#"{"type":42}"#,
            r#"{"type":"teleport"}"#,
            r#"{"type":"sync_request"}"#,
            r#"{"type":"undo","event_id":"not-a-uuid"}"#,
            r#"{"type":"diagram_change","element_id":"e1","element_type":"class","event_type":"EXPLODED","change_data":{}}"#,
        ];
        for text in cases {
            assert_matches!(
                ClientMessage::decode(text),
                Err(CollabError::MalformedMessage(_)),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_unknown_type_message() {
        let err = ClientMessage::decode(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(err.to_string().contains("Unknown message type"));
    }

    #[test]
    fn test_every_inbound_type_is_decodable_name() {
        let samples = [
            ClientMessage::Ping,
            ClientMessage::Leave,
            ClientMessage::SyncRequest { last_sequence_number: 1 },
            ClientMessage::ReleaseLock { element_id: "e".into(), element_path: String::new() },
            ClientMessage::CursorUpdate { cursor_data: json!({"x": 1}) },
            ClientMessage::Undo { event_id: Uuid::nil() },
            ClientMessage::SetRole { user_id: Uuid::nil(), role: ParticipantRole::Viewer },
        ];
        for msg in samples {
            assert!(INBOUND_TYPES.contains(&msg.kind()));
            let text = msg.encode().unwrap();
            assert_eq!(ClientMessage::decode(&text).unwrap(), msg);
        }
    }

    #[test]
    fn test_error_message_shape() {
        let holder = Uuid::new_v4();
        let msg = ServerMessage::error(&CollabError::ElementLocked {
            element_id: "e1".into(),
            holder,
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "ELEMENT_LOCKED");
        assert_eq!(value["holder"], holder.to_string());

        let plain = ServerMessage::error(&CollabError::MalformedMessage("x".into()));
        let value: Value = serde_json::from_str(&plain.encode().unwrap()).unwrap();
        assert!(value.get("holder").is_none());
    }

    #[test]
    fn test_only_cursor_excludes_origin() {
        assert!(ServerMessage::CursorUpdate { user_id: Uuid::nil(), cursor_data: Value::Null }.excludes_origin());
        assert!(!ServerMessage::pong().excludes_origin());
        assert!(!ServerMessage::UserLeft { user_id: Uuid::nil(), display_name: String::new() }.excludes_origin());
    }
}
