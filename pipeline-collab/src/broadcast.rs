//! Per-room fan-out to every connection except the originator.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a receiver that falls further behind observes
//! `RecvError::Lagged` and must be resynchronised from scratch.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::replica::ConnectionId;

/// A pre-encoded frame plus the connection it came from.
///
/// Receivers skip envelopes whose `origin` is themselves. Server-originated
/// frames (presence expiry) carry no origin and reach everyone.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Option<ConnectionId>,
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    pub fn is_from(&self, conn: ConnectionId) -> bool {
        self.origin == Some(conn)
    }
}

/// The broadcast channel for a single room.
///
/// Sending never blocks and takes no lock, so it is safe to call while the
/// room's replica mutex is held; that is what keeps per-sender ordering.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Enqueue a frame for every subscriber. Returns the receiver count.
    pub fn send(&self, origin: Option<ConnectionId>, frame: Vec<u8>) -> usize {
        let envelope = Envelope {
            origin,
            frame: Arc::new(frame),
        };
        self.sender.send(envelope).unwrap_or(0)
    }
}
