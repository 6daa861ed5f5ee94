//! Snapshot persistence for rooms.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   load / store    ┌─────────────────────┐
//! │ RoomRegistry │ ────────────────► │ PersistenceBackend  │
//! │ (debounced)  │  spawn_blocking   ├──────────┬──────────┤
//! └──────────────┘                   │ Memory   │ RocksDB  │
//!                                    │ (process)│ (durable)│
//!                                    └──────────┴──────────┘
//! ```
//!
//! A backend only ever sees opaque snapshot bytes keyed by room id, and only
//! the latest snapshot per room is kept. The mode is chosen once at startup.

pub mod memory;
pub mod rocks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Loads and stores whole-room snapshots.
///
/// Calls are blocking; async callers go through `spawn_blocking`. Calls for
/// different rooms may run concurrently, calls for one room never overlap.
pub trait PersistenceBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Latest snapshot for `room_id`, or `None` if the room was never stored.
    fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the stored snapshot for `room_id`.
    fn store(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// Which backend the server runs with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PersistenceMode {
    /// Snapshots live for the process lifetime only.
    #[default]
    Memory,
    /// Snapshots are written to RocksDB under `path`.
    Durable { path: PathBuf },
}

impl PersistenceMode {
    pub fn name(&self) -> &'static str {
        match self {
            PersistenceMode::Memory => "memory",
            PersistenceMode::Durable { .. } => "durable",
        }
    }
}

/// Open the backend selected by `mode`.
pub fn open_backend(mode: &PersistenceMode) -> Result<Arc<dyn PersistenceBackend>, StoreError> {
    match mode {
        PersistenceMode::Memory => Ok(Arc::new(MemoryBackend::new())),
        PersistenceMode::Durable { path } => {
            let backend = RocksBackend::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?;
            log::info!("Opened durable store at {}", path.display());
            Ok(Arc::new(backend))
        }
    }
}

/// One stored row: the latest snapshot of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceRecord {
    pub snapshot: Vec<u8>,
    /// Seconds since the Unix epoch.
    pub updated_at: u64,
}

impl PersistenceRecord {
    pub fn new(snapshot: Vec<u8>) -> Self {
        Self {
            snapshot,
            updated_at: unix_now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
