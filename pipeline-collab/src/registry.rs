//! Room registry: room id → live replica.
//!
//! ```text
//! acquire ──► [map lock] get-or-create Room ──► [room lock] attach
//!                 │
//!                 └─► load snapshot once (outside the map lock)
//!
//! release ──► [room lock] detach ──► 0 left? ──► eviction task
//!                                                  │ sleep(grace)
//!                                                  │ flush if dirty
//!                                                  ▼
//!                                    [map lock][room lock] still empty and
//!                                    same generation? ──► close + remove
//! ```
//!
//! Lock order is always map → room. Neither lock is held across storage I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{broadcast, watch, Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::broadcast::Envelope;
use crate::config::ServerConfig;
use crate::replica::{ConnectionId, DocumentReplica};
use crate::stats::ServerStats;
use crate::storage::{PersistenceBackend, StoreError};

/// Registry timing and sizing.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub broadcast_capacity: usize,
    pub grace_period: Duration,
    pub flush_debounce: Duration,
    pub presence_ttl: Duration,
    pub presence_sweep_interval: Duration,
}

impl From<&ServerConfig> for RegistrySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            broadcast_capacity: config.broadcast_capacity,
            grace_period: config.grace_period,
            flush_debounce: config.flush_debounce,
            presence_ttl: config.presence_ttl,
            presence_sweep_interval: config.presence_sweep_interval,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// A registered room: its replica behind a mutex plus load/flush guards.
pub struct Room {
    room_id: String,
    replica: Mutex<DocumentReplica>,
    loaded: OnceCell<()>,
    /// Serializes backend writes for this room.
    flush_lock: Mutex<()>,
}

impl Room {
    fn new(room_id: &str, settings: &RegistrySettings) -> Self {
        Self {
            room_id: room_id.to_string(),
            replica: Mutex::new(DocumentReplica::new(
                room_id,
                settings.broadcast_capacity,
                settings.presence_ttl,
            )),
            loaded: OnceCell::new(),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn replica(&self) -> &Mutex<DocumentReplica> {
        &self.replica
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }
}

/// What a connection gets back from [`RoomRegistry::acquire`].
pub struct Attachment {
    pub room: Arc<Room>,
    pub receiver: broadcast::Receiver<Envelope>,
}

/// Result of a flush sweep over every room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub flushed: usize,
    pub clean: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictOutcome {
    Evicted,
    Cancelled,
    Retry,
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    backend: Arc<dyn PersistenceBackend>,
    settings: RegistrySettings,
    stats: Arc<ServerStats>,
    loads: AtomicU64,
}

impl RoomRegistry {
    pub fn new(
        backend: Arc<dyn PersistenceBackend>,
        settings: RegistrySettings,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            backend,
            settings,
            stats,
            loads: AtomicU64::new(0),
        }
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Join `room_id`, creating and loading the room on first use.
    ///
    /// Attaching bumps the room's generation, which cancels any pending
    /// eviction. The returned room is fully loaded.
    pub async fn acquire(self: &Arc<Self>, room_id: &str, conn: ConnectionId) -> Attachment {
        let (room, receiver) = {
            let mut rooms = self.rooms.lock().await;
            let room = match rooms.get(room_id) {
                Some(room) => Arc::clone(room),
                None => {
                    let room = Arc::new(Room::new(room_id, &self.settings));
                    rooms.insert(room_id.to_string(), Arc::clone(&room));
                    self.stats.room_opened();
                    log::info!("Room {room_id} created");
                    room
                }
            };
            let receiver = room.replica.lock().await.attach(conn);
            (room, receiver)
        };
        self.stats.connection_opened();

        self.ensure_loaded(&room).await;
        Attachment { room, receiver }
    }

    async fn ensure_loaded(&self, room: &Arc<Room>) {
        room.loaded
            .get_or_init(|| async move {
                self.loads.fetch_add(1, Ordering::Relaxed);
                let backend = Arc::clone(&self.backend);
                let room_id = room.room_id.clone();
                let loaded = tokio::task::spawn_blocking(move || backend.load(&room_id)).await;

                let snapshot = match loaded {
                    Ok(Ok(snapshot)) => snapshot,
                    Ok(Err(e)) => {
                        log::error!("Failed to load room {}: {e}; starting empty", room.room_id);
                        None
                    }
                    Err(e) => {
                        log::error!("Load task for room {} failed: {e}", room.room_id);
                        None
                    }
                };

                if let Some(bytes) = snapshot {
                    let mut replica = room.replica.lock().await;
                    match replica.load_snapshot(&bytes) {
                        Ok(()) => log::info!(
                            "Room {} restored from {} bytes",
                            room.room_id,
                            bytes.len()
                        ),
                        Err(e) => log::error!("Stored snapshot for room {} is unusable: {e}", room.room_id),
                    }
                }
            })
            .await;
    }

    /// Leave a room. The last connection out starts the eviction timer.
    pub async fn release(self: &Arc<Self>, room: &Arc<Room>, conn: ConnectionId) {
        let (remaining, generation) = {
            let mut replica = room.replica.lock().await;
            let remaining = replica.detach(conn);
            (remaining, replica.generation())
        };
        self.stats.connection_closed();

        if remaining == 0 {
            log::debug!(
                "Room {} empty; evicting in {:?} unless rejoined",
                room.room_id,
                self.settings.grace_period
            );
            self.schedule_eviction(Arc::clone(room), generation);
        }
    }

    fn schedule_eviction(self: &Arc<Self>, room: Arc<Room>, generation: u64) {
        let registry = Arc::clone(self);
        let grace = self.settings.grace_period;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(grace).await;
                match registry.try_evict(&room, generation).await {
                    EvictOutcome::Retry => continue,
                    EvictOutcome::Evicted | EvictOutcome::Cancelled => break,
                }
            }
        });
    }

    async fn try_evict(&self, room: &Arc<Room>, generation: u64) -> EvictOutcome {
        if !room.replica.lock().await.is_evictable(generation) {
            return EvictOutcome::Cancelled;
        }

        if let Err(e) = self.flush_room(room).await {
            log::warn!("Final flush for room {} failed: {e}; keeping it in memory", room.room_id);
            return EvictOutcome::Retry;
        }

        let mut rooms = self.rooms.lock().await;
        let mut replica = room.replica.lock().await;
        if !replica.is_evictable(generation) {
            return EvictOutcome::Cancelled;
        }
        if replica.is_dirty() {
            return EvictOutcome::Retry;
        }

        replica.close();
        let idle = replica.last_activity().elapsed();
        drop(replica);
        if rooms
            .get(&room.room_id)
            .is_some_and(|current| Arc::ptr_eq(current, room))
        {
            rooms.remove(&room.room_id);
        }
        self.stats.room_closed();
        log::info!("Room {} evicted after {idle:.1?} idle", room.room_id);
        EvictOutcome::Evicted
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Arrange for a debounced flush of `room` unless one is already pending.
    pub async fn schedule_flush(self: &Arc<Self>, room: &Arc<Room>) {
        if !room.replica.lock().await.try_schedule_flush() {
            return;
        }
        let registry = Arc::clone(self);
        let room = Arc::clone(room);
        let debounce = self.settings.flush_debounce;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(debounce).await;
                {
                    let mut replica = room.replica.lock().await;
                    replica.flush_started();
                    if replica.is_closed() {
                        break;
                    }
                }
                match registry.flush_room(&room).await {
                    Ok(_) => break,
                    Err(e) => {
                        log::warn!("Flush of room {} failed: {e}; retrying", room.room_id);
                        if !room.replica.lock().await.try_schedule_flush() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Store the room's snapshot if it has unsaved changes.
    ///
    /// Returns `Ok(false)` when there was nothing to write. On failure the
    /// room is marked dirty again.
    pub async fn flush_room(&self, room: &Arc<Room>) -> Result<bool, StoreError> {
        let _guard = room.flush_lock.lock().await;

        let Some(snapshot) = room.replica.lock().await.take_dirty_snapshot() else {
            return Ok(false);
        };

        let backend = Arc::clone(&self.backend);
        let room_id = room.room_id.clone();
        let result = tokio::task::spawn_blocking(move || backend.store(&room_id, &snapshot))
            .await
            .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())));

        match result {
            Ok(()) => {
                self.stats.record_flush(true);
                log::debug!("Flushed room {}", room.room_id);
                Ok(true)
            }
            Err(e) => {
                room.replica.lock().await.mark_dirty();
                self.stats.record_flush(false);
                Err(e)
            }
        }
    }

    /// Flush every registered room concurrently.
    pub async fn flush_all(&self) -> FlushSummary {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        let results = join_all(rooms.iter().map(|room| self.flush_room(room))).await;

        let mut summary = FlushSummary::default();
        for (room, result) in rooms.iter().zip(results) {
            match result {
                Ok(true) => summary.flushed += 1,
                Ok(false) => summary.clean += 1,
                Err(e) => {
                    log::error!("Flush of room {} failed: {e}", room.room_id);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Expire stale presence in every room. Returns the number removed.
    pub async fn sweep_presence(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        let now = Instant::now();
        let mut removed = 0;
        for room in rooms {
            match room.replica.lock().await.sweep_presence(now) {
                Ok(count) => removed += count,
                Err(e) => log::warn!("Presence sweep in room {} failed: {e}", room.room_id),
            }
        }
        removed
    }

    /// Run the presence sweep until `shutdown` flips.
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.settings.presence_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.sweep_presence().await;
                        if removed > 0 {
                            log::debug!("Expired {removed} presence entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Number of backend loads performed since start.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::sync::atomic::AtomicBool;
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, Map, ReadTxn, Transact};

    /// Memory backend that can be told to fail writes.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
        attempts: AtomicU64,
    }

    impl PersistenceBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.load(room_id)
        }

        fn store(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk on fire".into()));
            }
            self.inner.store(room_id, snapshot)
        }
    }

    fn settings(grace_ms: u64, debounce_ms: u64) -> RegistrySettings {
        RegistrySettings {
            broadcast_capacity: 64,
            grace_period: Duration::from_millis(grace_ms),
            flush_debounce: Duration::from_millis(debounce_ms),
            presence_ttl: Duration::from_secs(30),
            presence_sweep_interval: Duration::from_secs(10),
        }
    }

    fn registry_with(
        backend: Arc<dyn PersistenceBackend>,
        settings: RegistrySettings,
    ) -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(backend, settings, Arc::new(ServerStats::new())))
    }

    fn add_node(doc: &Doc, id: &str) -> Vec<u8> {
        let nodes = doc.get_or_insert_map("nodes");
        let mut txn = doc.transact_mut();
        nodes.insert(&mut txn, id, "node");
        txn.encode_update_v1()
    }

    fn has_node(doc: &Doc, id: &str) -> bool {
        let nodes = doc.get_or_insert_map("nodes");
        let txn = doc.transact();
        nodes.contains_key(&txn, id)
    }

    async fn wait_until_evicted(registry: &RoomRegistry, room_id: &str) {
        for _ in 0..200 {
            if registry.get(room_id).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {room_id} was never evicted");
    }

    #[tokio::test]
    async fn test_acquire_same_room_shares_replica() {
        let registry = registry_with(Arc::new(MemoryBackend::new()), settings(50, 50));
        let a = registry.acquire("demo", ConnectionId::new()).await;
        let b = registry.acquire("demo", ConnectionId::new()).await;

        assert!(Arc::ptr_eq(&a.room, &b.room));
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(a.room.replica().lock().await.connection_count(), 2);
        assert_eq!(registry.load_count(), 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = registry_with(Arc::new(MemoryBackend::new()), settings(50, 50));
        let a = registry.acquire("a", ConnectionId::new()).await;
        let mut b = registry.acquire("b", ConnectionId::new()).await;

        a.room
            .replica()
            .lock()
            .await
            .apply_update(None, &add_node(&Doc::new(), "n1"))
            .unwrap();

        assert!(b.receiver.try_recv().is_err());
        assert!(!has_node(b.room.replica().lock().await.doc(), "n1"));
        assert_eq!(registry.room_ids().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_acquire_loads_stored_snapshot() {
        let backend = Arc::new(MemoryBackend::new());
        let author = Doc::new();
        add_node(&author, "n1");
        let snapshot = author
            .transact()
            .encode_state_as_update_v1(&yrs::StateVector::default());
        backend.store("demo", &snapshot).unwrap();

        let registry = registry_with(backend, settings(50, 50));
        let attachment = registry.acquire("demo", ConnectionId::new()).await;

        let replica = attachment.room.replica().lock().await;
        assert!(attachment.room.is_loaded());
        assert!(has_node(replica.doc(), "n1"));
        assert!(!replica.is_dirty());
    }

    #[tokio::test]
    async fn test_eviction_flushes_exactly_once() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = registry_with(backend.clone(), settings(50, 60_000));
        let conn = ConnectionId::new();
        let attachment = registry.acquire("demo", conn).await;

        attachment
            .room
            .replica()
            .lock()
            .await
            .apply_update(Some(conn), &add_node(&Doc::new(), "n1"))
            .unwrap();
        registry.release(&attachment.room, conn).await;

        wait_until_evicted(&registry, "demo").await;
        assert_eq!(backend.store_count(), 1);
        assert!(attachment.room.replica().lock().await.is_closed());

        let stored = backend.load("demo").unwrap().unwrap();
        let restored = Doc::new();
        restored
            .transact_mut()
            .apply_update(yrs::Update::decode_v1(&stored).unwrap())
            .unwrap();
        assert!(has_node(&restored, "n1"));
    }

    #[tokio::test]
    async fn test_clean_room_evicted_without_store() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = registry_with(backend.clone(), settings(20, 20));
        let conn = ConnectionId::new();
        let attachment = registry.acquire("demo", conn).await;
        registry.release(&attachment.room, conn).await;

        wait_until_evicted(&registry, "demo").await;
        assert_eq!(backend.store_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_reuses_replica() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = registry_with(backend.clone(), settings(150, 60_000));
        let first = ConnectionId::new();
        let attachment = registry.acquire("demo", first).await;
        attachment
            .room
            .replica()
            .lock()
            .await
            .apply_update(Some(first), &add_node(&Doc::new(), "n1"))
            .unwrap();
        registry.release(&attachment.room, first).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let again = registry.acquire("demo", ConnectionId::new()).await;

        // Outlive the original grace period.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(Arc::ptr_eq(&attachment.room, &again.room));
        assert!(registry.get("demo").await.is_some());
        assert_eq!(registry.load_count(), 1);
        assert_eq!(backend.store_count(), 0);
        assert!(has_node(again.room.replica().lock().await.doc(), "n1"));
    }

    #[tokio::test]
    async fn test_acquire_after_eviction_creates_fresh_room() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = registry_with(backend.clone(), settings(20, 60_000));
        let conn = ConnectionId::new();
        let first = registry.acquire("demo", conn).await;
        first
            .room
            .replica()
            .lock()
            .await
            .apply_update(Some(conn), &add_node(&Doc::new(), "n1"))
            .unwrap();
        registry.release(&first.room, conn).await;
        wait_until_evicted(&registry, "demo").await;

        let second = registry.acquire("demo", ConnectionId::new()).await;
        assert!(!Arc::ptr_eq(&first.room, &second.room));
        assert_eq!(registry.load_count(), 2);
        assert!(has_node(second.room.replica().lock().await.doc(), "n1"));
    }

    #[tokio::test]
    async fn test_debounced_flush_coalesces_updates() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = registry_with(backend.clone(), settings(60_000, 50));
        let conn = ConnectionId::new();
        let attachment = registry.acquire("demo", conn).await;
        let author = Doc::new();

        for id in ["n1", "n2", "n3"] {
            attachment
                .room
                .replica()
                .lock()
                .await
                .apply_update(Some(conn), &add_node(&author, id))
                .unwrap();
            registry.schedule_flush(&attachment.room).await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.store_count(), 1);
        assert!(!attachment.room.replica().lock().await.is_dirty());
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = registry_with(backend.clone(), settings(60_000, 60_000));
        let conn = ConnectionId::new();
        let attachment = registry.acquire("demo", conn).await;
        attachment
            .room
            .replica()
            .lock()
            .await
            .apply_update(Some(conn), &add_node(&Doc::new(), "n1"))
            .unwrap();

        assert!(registry.flush_room(&attachment.room).await.unwrap());
        let first = backend.load("demo").unwrap();
        assert!(!registry.flush_room(&attachment.room).await.unwrap());
        assert_eq!(backend.load("demo").unwrap(), first);
        assert_eq!(backend.store_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_stays_dirty_and_retries() {
        let backend = Arc::new(FlakyBackend::default());
        backend.failing.store(true, Ordering::SeqCst);
        let registry = registry_with(backend.clone(), settings(60_000, 30));
        let conn = ConnectionId::new();
        let attachment = registry.acquire("demo", conn).await;

        attachment
            .room
            .replica()
            .lock()
            .await
            .apply_update(Some(conn), &add_node(&Doc::new(), "n1"))
            .unwrap();
        registry.schedule_flush(&attachment.room).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(backend.attempts.load(Ordering::SeqCst) >= 2);
        assert!(attachment.room.replica().lock().await.is_dirty());

        backend.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!attachment.room.replica().lock().await.is_dirty());
        assert!(backend.inner.load("demo").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_flush_all_counts() {
        let registry = registry_with(Arc::new(MemoryBackend::new()), settings(60_000, 60_000));
        let conn = ConnectionId::new();
        let dirty = registry.acquire("dirty", conn).await;
        let _clean = registry.acquire("clean", ConnectionId::new()).await;
        dirty
            .room
            .replica()
            .lock()
            .await
            .apply_update(Some(conn), &add_node(&Doc::new(), "n1"))
            .unwrap();

        let summary = registry.flush_all().await;
        assert_eq!(
            summary,
            FlushSummary {
                flushed: 1,
                clean: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_stats_track_rooms_and_connections() {
        let stats = Arc::new(ServerStats::new());
        let registry = Arc::new(RoomRegistry::new(
            Arc::new(MemoryBackend::new()),
            settings(20, 20),
            stats.clone(),
        ));
        let conn = ConnectionId::new();
        let attachment = registry.acquire("demo", conn).await;
        assert_eq!(stats.snapshot().rooms, 1);
        assert_eq!(stats.snapshot().connections, 1);

        registry.release(&attachment.room, conn).await;
        wait_until_evicted(&registry, "demo").await;
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rooms, 0);
        assert_eq!(snapshot.connections, 0);
        assert_eq!(snapshot.evictions, 1);
    }
}
