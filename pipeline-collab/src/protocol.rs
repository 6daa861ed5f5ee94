//! Binary wire protocol for document sync and presence.
//!
//! Every WebSocket binary frame carries one message. Byte 0 is the kind,
//! the remainder is the body:
//! ```text
//! ┌──────────┬───────────┬─────────────────────────────────┐
//! │ tag (u8) │ kind      │ body                            │
//! ├──────────┼───────────┼─────────────────────────────────┤
//! │ 0        │ SyncStep1 │ yrs v1 state vector             │
//! │ 1        │ SyncStep2 │ yrs v1 update (diff)            │
//! │ 2        │ Update    │ yrs v1 update (delta)           │
//! │ 3        │ Awareness │ bincode-encoded AwarenessUpdate │
//! └──────────┴───────────┴─────────────────────────────────┘
//! ```
//!
//! Document bodies are passed through untouched so a received update can be
//! rebroadcast byte-for-byte without re-encoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message kinds, encoded as the first byte of each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's state vector; the receiver answers with what it is missing
    SyncStep1 = 0,
    /// Diff computed against a previously received state vector
    SyncStep2 = 1,
    /// Incremental document update
    Update = 2,
    /// Presence records
    Awareness = 3,
}

impl MessageType {
    /// Map a wire tag to its message kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::SyncStep1),
            1 => Some(Self::SyncStep2),
            2 => Some(Self::Update),
            3 => Some(Self::Awareness),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// One client's presence as carried on the wire.
///
/// `state` is an opaque metadata string (cursor position, display name,
/// colour) that the server never interprets. `None` removes the entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<String>,
}

impl PresenceRecord {
    pub fn update(client_id: u64, clock: u64, state: impl Into<String>) -> Self {
        Self {
            client_id,
            clock,
            state: Some(state.into()),
        }
    }

    pub fn removal(client_id: u64, clock: u64) -> Self {
        Self {
            client_id,
            clock,
            state: None,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }
}

/// Body of an `Awareness` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub records: Vec<PresenceRecord>,
}

impl AwarenessUpdate {
    pub fn new(records: Vec<PresenceRecord>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
    Awareness(AwarenessUpdate),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::SyncStep1(_) => MessageType::SyncStep1,
            Frame::SyncStep2(_) => MessageType::SyncStep2,
            Frame::Update(_) => MessageType::Update,
            Frame::Awareness(_) => MessageType::Awareness,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Frame::SyncStep1(body) | Frame::SyncStep2(body) | Frame::Update(body) => {
                Ok(tagged(self.message_type(), body))
            }
            Frame::Awareness(update) => {
                let body = bincode::serde::encode_to_vec(update, bincode::config::standard())
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Ok(tagged(MessageType::Awareness, &body))
            }
        }
    }

    /// Encode an `Update` frame straight from raw update bytes.
    pub fn encode_update(update: &[u8]) -> Vec<u8> {
        tagged(MessageType::Update, update)
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, body) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let kind = MessageType::from_tag(tag).ok_or(ProtocolError::UnknownTag(tag))?;
        match kind {
            MessageType::SyncStep1 => Ok(Frame::SyncStep1(body.to_vec())),
            MessageType::SyncStep2 => Ok(Frame::SyncStep2(body.to_vec())),
            MessageType::Update => Ok(Frame::Update(body.to_vec())),
            MessageType::Awareness => {
                let (update, _) =
                    bincode::serde::decode_from_slice(body, bincode::config::standard())
                        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
                Ok(Frame::Awareness(update))
            }
        }
    }
}

fn tagged(kind: MessageType, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(kind.tag());
    out.extend_from_slice(body);
    out
}

/// Frame codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("text frames are not part of the protocol")]
    UnexpectedText,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
