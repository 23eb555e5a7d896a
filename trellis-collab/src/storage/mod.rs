//! Persistent storage for sessions and change logs.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   append / update   ┌──────────────┐
//! │  ChangeLog   │ ──────────────────► │  EventStore  │
//! │  (in-memory) │                     │  (RocksDB)   │
//! └──────┬───────┘                     └──────┬───────┘
//!        │ on startup                         │ column families
//!        ▼                                    ▼
//! ┌──────────────┐     ┌───────────────────────────────────────────┐
//! │ recovered    │     │ CF "sessions" — session record + roster   │
//! │ logs/rosters │     │ CF "events"   — LZ4 JSON, key sid ++ seq   │
//! └──────────────┘     └───────────────────────────────────────────┘
//! ```
//!
//! Locks are leases and are never persisted.

pub mod rocks;

pub use rocks::{EventStore, StoreConfig, StoreError};
