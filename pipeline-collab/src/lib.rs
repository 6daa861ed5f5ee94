//! # pipeline-collab — real-time collaboration server for pipeline documents
//!
//! Clients edit a shared pipeline graph concurrently over WebSocket. Each
//! room holds one CRDT document; every peer converges to the same state
//! regardless of delay, reordering, or reconnects.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌──────────────────────────────────┐
//! │ SyncClient  │ ◄──────────────► │ SyncServer (gateway)             │
//! │ (per user)  │  /rooms/{name}   │   /health  /stats                │
//! └──────┬──────┘  binary frames   └──────┬───────────────────────────┘
//!        │                                │ one session per socket
//!        ▼                                ▼
//! ┌─────────────┐                  ┌─────────────┐   ┌────────────────┐
//! │ Yrs Doc     │                  │ RoomRegistry│──►│ Persistence-   │
//! │ (local)     │                  └──────┬──────┘   │ Backend        │
//! └─────────────┘                         │          │ memory/RocksDB │
//!                                  ┌──────┴──────┐   └────────────────┘
//!                                  │ Document-   │
//!                                  │ Replica     │── BroadcastGroup
//!                                  │ doc+presence│   (fan-out)
//!                                  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire frames (sync steps, updates, awareness)
//! - [`broadcast`] — Per-room fan-out with origin tagging
//! - [`presence`] — Awareness table with clocks and TTL expiry
//! - [`replica`] — One room's document, presence and connection set
//! - [`registry`] — Room lifecycle: lazy load, debounced flush, eviction
//! - [`session`] — Per-connection sync protocol
//! - [`server`] — axum gateway, HTTP routes and graceful shutdown
//! - [`storage`] — Persistence backends
//! - [`stats`] — Server counters and the periodic stats line
//! - [`config`] — Environment configuration
//! - [`client`] — WebSocket sync client

pub mod broadcast;
pub mod client;
pub mod config;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, Envelope};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use presence::{AwarenessTable, PresenceEntry};
pub use protocol::{AwarenessUpdate, Frame, MessageType, PresenceRecord, ProtocolError};
pub use registry::{FlushSummary, RegistrySettings, Room, RoomRegistry};
pub use replica::{ConnectionId, DocumentReplica, ReplicaError};
pub use server::{room_name, ServerError, ShutdownHandle, SyncServer};
pub use session::{SessionError, SyncSession};
pub use stats::{ServerStats, StatsSnapshot};
pub use storage::{
    MemoryBackend, PersistenceBackend, PersistenceMode, PersistenceRecord, RocksBackend,
    StoreConfig, StoreError,
};
