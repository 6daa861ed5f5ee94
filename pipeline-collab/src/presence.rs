//! Ephemeral presence ("awareness") for a room.
//!
//! Presence is never persisted. Each entry belongs to a client-chosen
//! `client_id` and carries a logical clock; a record is only accepted when
//! it is newer than what the table already holds, so reordered or replayed
//! records are dropped instead of flapping a cursor back and forth.
//!
//! ```text
//! Awareness frame ──► AwarenessTable::apply() ──► accepted records
//!                                                   │
//!                                                   ▼ broadcast to the room
//! connection closes ──► orphan()  (entry kept until TTL)
//! maintenance tick ──► sweep()    ──► removal records, broadcast
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{AwarenessUpdate, PresenceRecord};
use crate::replica::ConnectionId;

// ───────────────────────────────────────────────────────────────────
// Entries
// ───────────────────────────────────────────────────────────────────

/// Stored presence for one client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub clock: u64,
    pub state: String,
    /// Connection that last refreshed this entry; `None` once it closed.
    pub owner: Option<ConnectionId>,
    pub refreshed_at: Instant,
}

impl PresenceEntry {
    pub fn is_orphaned(&self) -> bool {
        self.owner.is_none()
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.refreshed_at) >= ttl
    }
}

// ───────────────────────────────────────────────────────────────────
// Table
// ───────────────────────────────────────────────────────────────────

/// Presence entries for every client in one room.
#[derive(Debug)]
pub struct AwarenessTable {
    entries: HashMap<u64, PresenceEntry>,
    /// Last clock seen for removed clients, so late records cannot revive them.
    tombstones: HashMap<u64, (u64, Instant)>,
    ttl: Duration,
}

impl AwarenessTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            tombstones: HashMap::new(),
            ttl,
        }
    }

    /// Apply records received from `origin`.
    ///
    /// Returns the records that changed the table, in input order. Only these
    /// should be rebroadcast.
    pub fn apply(
        &mut self,
        origin: ConnectionId,
        update: AwarenessUpdate,
        now: Instant,
    ) -> Vec<PresenceRecord> {
        let mut accepted = Vec::with_capacity(update.records.len());

        for record in update.records {
            if !self.is_fresh(&record) {
                log::trace!(
                    "Dropping stale presence for client {} (clock {})",
                    record.client_id,
                    record.clock
                );
                continue;
            }

            match &record.state {
                Some(state) => {
                    self.tombstones.remove(&record.client_id);
                    self.entries.insert(
                        record.client_id,
                        PresenceEntry {
                            clock: record.clock,
                            state: state.clone(),
                            owner: Some(origin),
                            refreshed_at: now,
                        },
                    );
                }
                None => {
                    let existed = self.entries.remove(&record.client_id).is_some();
                    self.tombstones.insert(record.client_id, (record.clock, now));
                    if !existed {
                        continue;
                    }
                }
            }
            accepted.push(record);
        }

        accepted
    }

    fn is_fresh(&self, record: &PresenceRecord) -> bool {
        if let Some(entry) = self.entries.get(&record.client_id) {
            return record.clock > entry.clock
                || (record.clock == entry.clock && record.is_removal());
        }
        match self.tombstones.get(&record.client_id) {
            Some((clock, _)) => record.clock > *clock,
            None => true,
        }
    }

    /// Detach every entry owned by `conn`. Entries stay visible until they
    /// expire or their client reconnects and refreshes them.
    pub fn orphan(&mut self, conn: ConnectionId) -> usize {
        let mut count = 0;
        for entry in self.entries.values_mut() {
            if entry.owner == Some(conn) {
                entry.owner = None;
                count += 1;
            }
        }
        count
    }

    /// Remove entries not refreshed within the TTL.
    ///
    /// Returns removal records with a bumped clock so clients holding the
    /// old entry accept them.
    pub fn sweep(&mut self, now: Instant) -> Vec<PresenceRecord> {
        let ttl = self.ttl;
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, ttl))
            .map(|(id, _)| *id)
            .collect();

        let mut removals = Vec::with_capacity(expired.len());
        for client_id in expired {
            if let Some(entry) = self.entries.remove(&client_id) {
                let clock = entry.clock + 1;
                self.tombstones.insert(client_id, (clock, now));
                removals.push(PresenceRecord::removal(client_id, clock));
            }
        }

        self.tombstones
            .retain(|_, (_, removed_at)| now.saturating_duration_since(*removed_at) < ttl);

        removals.sort_by_key(|r| r.client_id);
        removals
    }

    /// Every live entry, ordered by client id.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut records: Vec<PresenceRecord> = self
            .entries
            .iter()
            .map(|(id, entry)| PresenceRecord::update(*id, entry.clock, entry.state.clone()))
            .collect();
        records.sort_by_key(|r| r.client_id);
        AwarenessUpdate::new(records)
    }

    pub fn get(&self, client_id: u64) -> Option<&PresenceEntry> {
        self.entries.get(&client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
