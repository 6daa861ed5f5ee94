//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - The state-vector handshake, so edits made while offline are sent on
//!   the next connect
//! - Local edits broadcast as updates, remote updates merged into the
//!   local document
//! - Presence publishing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::protocol::{AwarenessUpdate, Frame, PresenceRecord, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake not finished
    Connected,
    /// Server state received and merged
    Synced,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    /// The server's missing state was merged into the local document
    Synced,
    /// An update from another peer was merged
    RemoteUpdate(Vec<u8>),
    Presence(AwarenessUpdate),
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("not connected")]
    NotConnected,
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// The sync client.
///
/// Holds a local replica of one room's document and keeps it in step with
/// the server while connected.
pub struct SyncClient {
    server_url: String,
    room_id: String,
    doc: Arc<Mutex<Doc>>,
    presence_id: u64,
    presence_clock: Arc<AtomicU64>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Outgoing>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl SyncClient {
    /// Create a client for `room_id` on a server such as `ws://127.0.0.1:4455`.
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            doc: Arc::new(Mutex::new(Doc::new())),
            presence_id: Uuid::new_v4().as_u64_pair().0,
            presence_clock: Arc::new(AtomicU64::new(0)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Publish presence under a fixed id, e.g. to resume it after reconnecting.
    pub fn with_presence_id(mut self, presence_id: u64) -> Self {
        self.presence_id = presence_id;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and start the handshake.
    ///
    /// Spawns background tasks for reading and writing the socket.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/rooms/{}", self.server_url.trim_end_matches('/'), self.room_id);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(256);
        self.outgoing_tx = Some(out_tx.clone());

        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                let message = match outgoing {
                    Outgoing::Frame(data) => Message::Binary(data.into()),
                    Outgoing::Close => Message::Close(None),
                };
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected);

        let state_vector = lock_doc(&self.doc).transact().state_vector().encode_v1();
        self.send(Frame::SyncStep1(state_vector).encode()?).await?;

        let doc = Arc::clone(&self.doc);
        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        let presence_id = self.presence_id;
        let presence_clock = Arc::clone(&self.presence_clock);
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        let frame = match Frame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame from server: {e}");
                                continue;
                            }
                        };
                        match frame {
                            Frame::SyncStep1(sv) => match encode_diff(&doc, &sv) {
                                Some(diff) => {
                                    let reply = Frame::SyncStep2(diff).encode();
                                    if let Ok(bytes) = reply {
                                        let _ = out_tx.send(Outgoing::Frame(bytes)).await;
                                    }
                                }
                                None => log::warn!("Server sent an invalid state vector"),
                            },
                            Frame::SyncStep2(update) => {
                                if apply_remote(&doc, &update) {
                                    *state.write().await = ConnectionState::Synced;
                                    let _ = event_tx.send(SyncEvent::Synced);
                                }
                            }
                            Frame::Update(update) => {
                                if apply_remote(&doc, &update) {
                                    let _ = event_tx.send(SyncEvent::RemoteUpdate(update));
                                }
                            }
                            Frame::Awareness(update) => {
                                // Our own entry expired server-side; publish past its removal.
                                for record in update.records.iter().filter(|r| r.client_id == presence_id) {
                                    presence_clock.fetch_max(record.clock, Ordering::Relaxed);
                                }
                                let _ = event_tx.send(SyncEvent::Presence(update));
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        Ok(())
    }

    /// Apply a local edit and send the resulting update if connected.
    ///
    /// Offline edits stay in the local document and reach the server during
    /// the next handshake. Returns the encoded update.
    pub async fn apply_local<F>(&self, edit: F) -> Result<Vec<u8>, ClientError>
    where
        F: FnOnce(&mut TransactionMut<'_>),
    {
        let update = {
            let doc = lock_doc(&self.doc);
            let mut txn = doc.transact_mut();
            edit(&mut txn);
            txn.encode_update_v1()
        };

        if self.is_connected().await {
            self.send(Frame::encode_update(&update)).await?;
        }
        Ok(update)
    }

    /// Publish (or with `None`, withdraw) this client's presence.
    pub async fn send_presence(&self, state: Option<String>) -> Result<(), ClientError> {
        let clock = self.presence_clock.fetch_add(1, Ordering::Relaxed) + 1;
        let record = match state {
            Some(state) => PresenceRecord::update(self.presence_id, clock, state),
            None => PresenceRecord::removal(self.presence_id, clock),
        };
        let frame = Frame::Awareness(AwarenessUpdate::new(vec![record]));
        self.send(frame.encode()?).await
    }

    /// Run `f` against the local document.
    pub fn with_doc<R>(&self, f: impl FnOnce(&Doc) -> R) -> R {
        f(&lock_doc(&self.doc))
    }

    /// Close the socket. The local document is kept for a later reconnect.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Outgoing::Close).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn is_connected(&self) -> bool {
        matches!(
            self.connection_state().await,
            ConnectionState::Connected | ConnectionState::Synced
        )
    }

    pub fn presence_id(&self) -> u64 {
        self.presence_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Outgoing::Frame(bytes))
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

fn lock_doc(doc: &Mutex<Doc>) -> std::sync::MutexGuard<'_, Doc> {
    doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encode_diff(doc: &Mutex<Doc>, state_vector: &[u8]) -> Option<Vec<u8>> {
    let sv = StateVector::decode_v1(state_vector).ok()?;
    Some(lock_doc(doc).transact().encode_diff_v1(&sv))
}

fn apply_remote(doc: &Mutex<Doc>, update: &[u8]) -> bool {
    let update = match Update::decode_v1(update) {
        Ok(update) => update,
        Err(e) => {
            log::warn!("Dropping undecodable update from server: {e}");
            return false;
        }
    };
    let doc = lock_doc(doc);
    let mut txn = doc.transact_mut();
    match txn.apply_update(update) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Failed to integrate update from server: {e}");
            false
        }
    }
}
