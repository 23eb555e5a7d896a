//! RocksDB-backed session and change-event store.
//!
//! Column families:
//! - `sessions` — Session records including the roster (bincode)
//! - `events`   — Change events (LZ4-compressed JSON, keyed by session_id:sequence)
//!
//! Event keys are `<session_id:16 bytes><sequence:8 bytes big-endian>` so a
//! forward iterator from `(session, n)` yields that session's events in
//! sequence order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ChangeEvent, Session};

const CF_SESSIONS: &str = "sessions";
const CF_EVENTS: &str = "events";

const COLUMN_FAMILIES: &[&str] = &[CF_SESSIONS, CF_EVENTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("trellis_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Session not found: {0}")]
    NotFound(Uuid),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable backing for the session registry and change log.
pub struct EventStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl EventStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened event store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SESSIONS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_EVENTS => {
                // Values are already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Insert or overwrite a session record.
    pub fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let bytes = bincode::serde::encode_to_vec(session, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.db.put_cf_opt(cf, session.id.as_bytes(), bytes, &self.write_opts())?;
        Ok(())
    }

    pub fn load_session(&self, session_id: Uuid) -> Result<Session, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(bytes) => {
                let (session, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(session)
            }
            None => Err(StoreError::NotFound(session_id)),
        }
    }

    /// All stored session records, in key order.
    pub fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let (session, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            sessions.push(session);
        }
        Ok(sessions)
    }

    /// Delete a session record and every event it owns.
    ///
    /// The server never deletes history; this is for retention tooling that
    /// opens the store offline.
    pub fn delete_session(&self, session_id: Uuid) -> Result<u64, StoreError> {
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let cf_events = self.cf(CF_EVENTS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_sessions, session_id.as_bytes());

        let mut count = 0u64;
        let start_key = Self::event_key(session_id, 0);
        let iter = self
            .db
            .iterator_cf(cf_events, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() < 24 || &key[..16] != session_id.as_bytes() {
                break;
            }
            batch.delete_cf(cf_events, &key);
            count += 1;
        }

        self.db.write_opt(batch, &self.write_opts())?;
        Ok(count)
    }

    // ─── Events ───────────────────────────────────────────────────────

    /// Write an event under its (session, sequence) key. Also used to
    /// overwrite an event when its broadcast count is recorded.
    pub fn put_event(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let json = serde_json::to_vec(event)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);
        let key = Self::event_key(event.session_id, event.sequence_number);
        self.db.put_cf_opt(cf, key, compressed, &self.write_opts())?;
        Ok(())
    }

    /// Events of one session with sequence strictly greater than `after`, ascending.
    pub fn load_events_since(
        &self,
        session_id: Uuid,
        after: u64,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let start_key = Self::event_key(session_id, after.saturating_add(1));

        let mut events = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != session_id.as_bytes() {
                break;
            }
            let json = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let event: ChangeEvent = serde_json::from_slice(&json)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            events.push(event);
        }
        Ok(events)
    }

    pub fn load_all_events(&self, session_id: Uuid) -> Result<Vec<ChangeEvent>, StoreError> {
        self.load_events_since(session_id, 0)
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn event_key(session_id: Uuid, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(session_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
