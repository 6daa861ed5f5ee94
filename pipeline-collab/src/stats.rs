//! Process-wide counters.
//!
//! Updated with relaxed atomics on the hot path and read as an eventually
//! consistent [`StatsSnapshot`] by `/stats` and the periodic log line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct ServerStats {
    rooms: AtomicU64,
    connections: AtomicU64,
    total_connections: AtomicU64,
    messages_in: AtomicU64,
    bytes_in: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub rooms: u64,
    pub connections: u64,
    pub total_connections: u64,
    pub messages_in: u64,
    pub bytes_in: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub evictions: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_opened(&self) {
        self.rooms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_closed(&self) {
        decrement(&self.rooms);
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        decrement(&self.connections);
    }

    pub fn record_message(&self, bytes: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_flush(&self, ok: bool) {
        if ok {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rooms: self.rooms.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
}

impl StatsSnapshot {
    pub fn is_idle(&self) -> bool {
        self.rooms == 0 && self.connections == 0
    }
}

/// Log a stats line every `interval` while anything is open, until
/// `shutdown` flips.
pub fn spawn_reporter(
    stats: Arc<ServerStats>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = stats.snapshot();
                    if !snapshot.is_idle() {
                        log::info!(
                            "Stats: {} rooms, {} connections, {} messages in, {} flushes ({} failed), {} evictions",
                            snapshot.rooms,
                            snapshot.connections,
                            snapshot.messages_in,
                            snapshot.flushes,
                            snapshot.flush_failures,
                            snapshot.evictions,
                        );
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
