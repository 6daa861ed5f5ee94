//! Per-connection sync protocol.
//!
//! ```text
//! join ──► SyncStep1(server sv) ──► Awareness(snapshot, if any)
//!
//! loop select! {
//!   socket frame      ──► SyncStep1(sv)      → reply SyncStep2(diff)
//!                         SyncStep2 / Update → merge, rebroadcast as Update
//!                         Awareness          → apply, rebroadcast accepted
//!   room broadcast    ──► forward unless we sent it; lagged → close
//!   idle deadline     ──► close
//!   shutdown          ──► Close frame
//! }
//! ```
//!
//! A session owns its socket exclusively. It only touches shared state
//! through the room mutex, and never holds it across socket writes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, MutexGuard};
use tokio::time::Instant;

use crate::broadcast::Envelope;
use crate::protocol::{Frame, ProtocolError};
use crate::registry::{Attachment, Room, RoomRegistry};
use crate::replica::{ConnectionId, DocumentReplica, ReplicaError};
use crate::stats::ServerStats;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("rejected update: {0}")]
    Replica(#[from] ReplicaError),
    #[error("room was closed underneath the connection")]
    RoomClosed,
    #[error("connection fell {0} frames behind the room")]
    Lagged(u64),
    #[error("no frames received for {0:?}")]
    IdleTimeout(Duration),
}

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<RoomRegistry>,
    pub stats: Arc<ServerStats>,
    pub idle_timeout: Duration,
    /// Flips to `true` when open connections must close.
    pub close_rx: watch::Receiver<bool>,
}

/// Protocol state for one connection in one room.
pub struct SyncSession {
    conn: ConnectionId,
    room: Arc<Room>,
    registry: Arc<RoomRegistry>,
}

impl SyncSession {
    pub fn new(conn: ConnectionId, room: Arc<Room>, registry: Arc<RoomRegistry>) -> Self {
        Self {
            conn,
            room,
            registry,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    async fn lock_open(&self) -> Result<MutexGuard<'_, DocumentReplica>, SessionError> {
        let replica = self.room.replica().lock().await;
        if replica.is_closed() {
            return Err(SessionError::RoomClosed);
        }
        Ok(replica)
    }

    /// Frames sent to the peer right after it joins.
    pub async fn greeting(&self) -> Result<Vec<Frame>, SessionError> {
        let replica = self.lock_open().await?;
        let mut frames = vec![Frame::SyncStep1(replica.state_vector())];
        let awareness = replica.awareness_snapshot();
        if !awareness.is_empty() {
            frames.push(Frame::Awareness(awareness));
        }
        Ok(frames)
    }

    /// Process one inbound frame; returns the direct reply, if any.
    pub async fn handle_frame(&self, frame: Frame) -> Result<Option<Frame>, SessionError> {
        match frame {
            Frame::SyncStep1(state_vector) => {
                let replica = self.lock_open().await?;
                let diff = replica.encode_diff(&state_vector)?;
                Ok(Some(Frame::SyncStep2(diff)))
            }
            Frame::SyncStep2(update) | Frame::Update(update) => {
                let changed = self
                    .lock_open()
                    .await?
                    .apply_update(Some(self.conn), &update)?;
                if changed {
                    self.registry.schedule_flush(&self.room).await;
                }
                Ok(None)
            }
            Frame::Awareness(update) => {
                let accepted = self.lock_open().await?.apply_awareness(
                    self.conn,
                    update,
                    std::time::Instant::now(),
                )?;
                log::trace!(
                    "Connection {} published {accepted} presence records in room {}",
                    self.conn,
                    self.room.room_id()
                );
                Ok(None)
            }
        }
    }

    async fn drive(
        &self,
        ws: WebSocket,
        mut receiver: broadcast::Receiver<Envelope>,
        ctx: &mut SessionContext,
    ) -> Result<(), SessionError> {
        let (mut sink, mut stream) = ws.split();

        for frame in self.greeting().await? {
            sink.send(Message::Binary(frame.encode()?.into())).await?;
        }

        let mut last_inbound = Instant::now();
        loop {
            let idle_deadline = last_inbound + ctx.idle_timeout;
            tokio::select! {
                incoming = stream.next() => {
                    last_inbound = Instant::now();
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            ctx.stats.record_message(data.len());
                            let frame = Frame::decode(&data)?;
                            if let Some(reply) = self.handle_frame(frame).await? {
                                sink.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            sink.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Text(_))) => {
                            return Err(ProtocolError::UnexpectedText.into());
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                outgoing = receiver.recv() => {
                    match outgoing {
                        Ok(envelope) => {
                            if !envelope.is_from(self.conn) {
                                sink.send(Message::Binary(envelope.frame.to_vec().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => return Err(SessionError::Lagged(n)),
                        Err(RecvError::Closed) => return Err(SessionError::RoomClosed),
                    }
                }

                _ = tokio::time::sleep_until(idle_deadline) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Err(SessionError::IdleTimeout(ctx.idle_timeout));
                }

                changed = ctx.close_rx.changed() => {
                    if changed.is_err() || *ctx.close_rx.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Run the sync protocol for an upgraded connection until it ends.
///
/// The connection is registered with the room for exactly the duration of
/// this call.
pub async fn run_session(
    ws: WebSocket,
    room_id: &str,
    mut ctx: SessionContext,
) -> Result<(), SessionError> {
    let conn = ConnectionId::new();
    let Attachment { room, receiver } = ctx.registry.acquire(room_id, conn).await;
    log::info!("Connection {conn} joined room {room_id}");

    let session = SyncSession::new(conn, room, Arc::clone(&ctx.registry));
    let result = if *ctx.close_rx.borrow() {
        Ok(())
    } else {
        session.drive(ws, receiver, &mut ctx).await
    };

    ctx.registry.release(session.room(), conn).await;
    match &result {
        Ok(()) => log::info!("Connection {conn} left room {room_id}"),
        Err(e) => log::warn!("Connection {conn} in room {room_id} closed: {e}"),
    }
    result
}
