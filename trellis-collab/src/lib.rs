//! # trellis-collab — Real-time coordination for shared diagrams
//!
//! Participants connect to a diagram over WebSocket, take short-lived locks
//! on elements, and submit edits. Every accepted edit is appended to a
//! per-session change log and fanned out to everyone in the session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Participant │ ◄─────────────────► │ CollabServer│
//! │ (per tab)   │     JSON frames     │ (gateway)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │     Hub     │
//!                                     └──────┬──────┘
//!            ┌──────────────┬────────────────┼───────────────┐
//!            ▼              ▼                ▼               ▼
//!   ┌────────────────┐ ┌──────────┐ ┌────────────────┐ ┌───────────────┐
//!   │SessionRegistry │ │LockTable │ │ConflictResolver│ │BroadcastRouter│
//!   └───────┬────────┘ └──────────┘ └───────┬────────┘ └───────────────┘
//!           │                               ▼
//!           │                         ┌──────────┐
//!           └────────────────────────►│ChangeLog │──► EventStore (RocksDB)
//!                                     └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] — sessions per diagram, rosters and roles
//! - [`locks`] — element locks with leases
//! - [`changelog`] — ordered, append-only change events
//! - [`resolver`] — edit admission and undo
//! - [`broadcast`] — room-based fan-out with backpressure
//! - [`protocol`] — JSON wire messages
//! - [`hub`] — ties the above together per connection
//! - [`server`] — WebSocket gateway
//! - [`storage`] — RocksDB persistence

pub mod auth;
pub mod broadcast;
pub mod changelog;
pub mod config;
pub mod error;
pub mod hub;
pub mod locks;
pub mod model;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{IdentityProvider, StaticTokenProvider};
pub use broadcast::{BroadcastGroup, BroadcastRouter, Envelope};
pub use changelog::ChangeLog;
pub use config::ServerConfig;
pub use error::{CollabError, CollabResult};
pub use hub::{Connection, Hub};
pub use locks::LockTable;
pub use model::{
    ChangeEvent, EditRequest, ElementLock, EventType, LockKind, Participant, ParticipantRole,
    ParticipantStatus, Session, SessionStatus, UserIdentity,
};
pub use protocol::{ClientMessage, ServerMessage};
pub use resolver::ConflictResolver;
pub use server::{CollabServer, ServerStats};
pub use session::SessionRegistry;
pub use storage::{EventStore, StoreConfig, StoreError};
