//! One room's replicated document plus its connected peers.
//!
//! The replica is always accessed through the room's mutex (see
//! [`crate::registry::Room`]). Every mutation and its broadcast happen under
//! that lock, which is what gives each sender's updates a single total order
//! as seen by every other connection.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::presence::AwarenessTable;
use crate::protocol::{AwarenessUpdate, Frame, ProtocolError};

/// A v1 update that carries no structs and no deletions.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Identity of one socket, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("malformed state vector: {0}")]
    StateVector(String),
    #[error("malformed update: {0}")]
    Update(String),
    #[error("failed to integrate update: {0}")]
    Integrate(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// In-memory state of one room.
pub struct DocumentReplica {
    room_id: String,
    doc: Doc,
    awareness: AwarenessTable,
    connections: HashSet<ConnectionId>,
    broadcast: BroadcastGroup,
    /// Set by any state-changing update since the last successful flush.
    dirty: bool,
    last_activity: Instant,
    /// Bumped on every attach/detach; an eviction only proceeds if it still
    /// matches the value it was scheduled with.
    generation: u64,
    closed: bool,
    flush_scheduled: bool,
}

impl DocumentReplica {
    pub fn new(room_id: impl Into<String>, broadcast_capacity: usize, presence_ttl: Duration) -> Self {
        Self {
            room_id: room_id.into(),
            doc: Doc::new(),
            awareness: AwarenessTable::new(presence_ttl),
            connections: HashSet::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            dirty: false,
            last_activity: Instant::now(),
            generation: 0,
            closed: false,
            flush_scheduled: false,
        }
    }

    // ─── Document ─────────────────────────────────────────────────────

    /// Merge a persisted snapshot. Does not mark the replica dirty.
    pub fn load_snapshot(&mut self, snapshot: &[u8]) -> Result<(), ReplicaError> {
        self.integrate(snapshot)
    }

    /// Merge an update received from `origin` and rebroadcast it.
    ///
    /// Returns `false` when the update carried nothing, in which case it is
    /// neither broadcast nor counted as a change.
    pub fn apply_update(
        &mut self,
        origin: Option<ConnectionId>,
        update: &[u8],
    ) -> Result<bool, ReplicaError> {
        if update == EMPTY_UPDATE {
            return Ok(false);
        }
        self.integrate(update)?;
        self.dirty = true;
        self.touch();
        self.broadcast.send(origin, Frame::encode_update(update));
        Ok(true)
    }

    fn integrate(&mut self, update: &[u8]) -> Result<(), ReplicaError> {
        let decoded = Update::decode_v1(update).map_err(|e| ReplicaError::Update(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| ReplicaError::Integrate(e.to_string()))
    }

    /// Encoded v1 state vector of the replica.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything the replica has that a peer at `state_vector` lacks.
    /// An empty input is treated as the empty state vector.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = if state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(state_vector)
                .map_err(|e| ReplicaError::StateVector(e.to_string()))?
        };
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    pub fn encode_full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Apply presence from `origin`; accepted records are broadcast to the
    /// rest of the room. Returns how many were accepted.
    pub fn apply_awareness(
        &mut self,
        origin: ConnectionId,
        update: AwarenessUpdate,
        now: Instant,
    ) -> Result<usize, ReplicaError> {
        let accepted = self.awareness.apply(origin, update, now);
        if accepted.is_empty() {
            return Ok(0);
        }
        let count = accepted.len();
        let frame = Frame::Awareness(AwarenessUpdate::new(accepted)).encode()?;
        self.touch();
        self.broadcast.send(Some(origin), frame);
        Ok(count)
    }

    /// Expire stale presence and broadcast the removals to everyone.
    pub fn sweep_presence(&mut self, now: Instant) -> Result<usize, ReplicaError> {
        let removals = self.awareness.sweep(now);
        if removals.is_empty() {
            return Ok(0);
        }
        let count = removals.len();
        let frame = Frame::Awareness(AwarenessUpdate::new(removals)).encode()?;
        self.broadcast.send(None, frame);
        Ok(count)
    }

    pub fn awareness_snapshot(&self) -> AwarenessUpdate {
        self.awareness.snapshot()
    }

    pub fn awareness(&self) -> &AwarenessTable {
        &self.awareness
    }

    // ─── Connections ──────────────────────────────────────────────────

    /// Register a connection and hand back its broadcast receiver.
    pub fn attach(&mut self, conn: ConnectionId) -> broadcast::Receiver<Envelope> {
        self.connections.insert(conn);
        self.generation += 1;
        self.touch();
        self.broadcast.subscribe()
    }

    /// Remove a connection, orphaning its presence. Returns the remaining count.
    pub fn detach(&mut self, conn: ConnectionId) -> usize {
        if self.connections.remove(&conn) {
            self.generation += 1;
            let orphaned = self.awareness.orphan(conn);
            if orphaned > 0 {
                log::debug!(
                    "Room {}: {orphaned} presence entries orphaned by {conn}",
                    self.room_id
                );
            }
        }
        self.connections.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Take a full snapshot for flushing, clearing the dirty flag.
    ///
    /// If the store then fails the caller must call [`mark_dirty`](Self::mark_dirty).
    pub fn take_dirty_snapshot(&mut self) -> Option<Vec<u8>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.encode_full_state())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True when nothing has attached or detached since `generation` was read
    /// and no connection remains.
    pub fn is_evictable(&self, generation: u64) -> bool {
        !self.closed && self.connections.is_empty() && self.generation == generation
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Claim the pending-flush slot. Returns `false` if one is already pending.
    pub fn try_schedule_flush(&mut self) -> bool {
        if self.flush_scheduled || self.closed {
            return false;
        }
        self.flush_scheduled = true;
        true
    }

    pub fn flush_started(&mut self) {
        self.flush_scheduled = false;
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
