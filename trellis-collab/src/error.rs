//! Error taxonomy shared by every coordination component.
//!
//! Rejections (`PermissionDenied`, `ElementLocked`, `MalformedMessage`) are
//! reported to the originating connection only and never affect the session.
//! `InternalFailure` is surfaced and logged but never retried here: a retry
//! could duplicate a sequence number or re-acquire a released lock.

use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoreError;

/// Crate-wide result alias.
pub type CollabResult<T> = Result<T, CollabError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    /// The participant's role forbids the action.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Another participant holds an active lock on the element.
    #[error("element {element_id} is locked by {holder}")]
    ElementLocked { element_id: String, holder: Uuid },

    /// The session has ended and is immutable.
    #[error("session {0} is closed")]
    SessionClosed(Uuid),

    /// Unknown session, participant, event or lock.
    #[error("not found: {0}")]
    NotFound(String),

    /// Undecodable frame or missing required fields.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Storage or broadcast infrastructure fault.
    #[error("internal failure: {0}")]
    InternalFailure(String),
}

impl CollabError {
    /// Stable code sent in outbound `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::ElementLocked { .. } => "ELEMENT_LOCKED",
            Self::SessionClosed(_) => "SESSION_CLOSED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::InternalFailure(_) => "INTERNAL_FAILURE",
        }
    }

    /// The current lock holder, for `ElementLocked` rejections.
    pub fn holder(&self) -> Option<Uuid> {
        match self {
            Self::ElementLocked { holder, .. } => Some(*holder),
            _ => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::InternalFailure(_))
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::InternalFailure(e.to_string())
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::MalformedMessage(e.to_string())
    }
}
