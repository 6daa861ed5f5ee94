//! Process-lifetime snapshot store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{PersistenceBackend, PersistenceRecord, StoreError};

/// Keeps the latest snapshot per room in a hash map. Never fails except on a
/// poisoned lock, and loses everything on exit.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    rooms: RwLock<HashMap<String, PersistenceRecord>>,
    stores: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored row for `room_id`, including its timestamp.
    pub fn record(&self, room_id: &str) -> Result<Option<PersistenceRecord>, StoreError> {
        let rooms = self
            .rooms
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(rooms.get(room_id).cloned())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().map(|rooms| rooms.len()).unwrap_or(0)
    }

    /// Number of successful `store` calls since creation.
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }
}

impl PersistenceBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.record(room_id)?.map(|record| record.snapshot))
    }

    fn store(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut rooms = self
            .rooms
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        rooms.insert(room_id.to_string(), PersistenceRecord::new(snapshot.to_vec()));
        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_then_load() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.load("demo").unwrap(), None);

        backend.store("demo", b"v1").unwrap();
        backend.store("demo", b"v2").unwrap();

        assert_eq!(backend.load("demo").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(backend.store_count(), 2);
        assert_eq!(backend.room_count(), 1);
    }

    #[test]
    fn test_rooms_are_isolated() {
        let backend = MemoryBackend::new();
        backend.store("a", b"alpha").unwrap();
        backend.store("b", b"beta").unwrap();

        assert_eq!(backend.load("a").unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(backend.load("b").unwrap(), Some(b"beta".to_vec()));
        assert!(backend.record("a").unwrap().unwrap().updated_at > 0);
    }
}
