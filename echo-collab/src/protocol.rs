//! Binary wire protocol for change-log synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ space_id │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are bincode-encoded structs, one per message type. `Batch`
//! payloads carry signed changes, each encoded on its own so one bad change
//! cannot spoil its neighbours, and are LZ4-compressed on top.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use echo_core::{ActorId, Change, ChangeError, DocumentId, Frontier, SpaceId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Bumped whenever a payload layout changes.
pub const PROTOCOL_VERSION: u8 = 2;

/// Upper bound on a decompressed batch payload.
pub const MAX_BATCH_PAYLOAD: usize = 64 * 1024 * 1024;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Opens a session: who we are and which space we replicate
    Hello = 1,
    /// Per-actor frontier plus per-document digests
    Announce = 2,
    /// Changes the receiver is missing, dependencies first
    Batch = 3,
    /// Receipt for one batch
    Ack = 4,
    /// Sender has nothing more to stream for now
    Done = 5,
    /// Liveness check
    Ping = 6,
    /// Liveness reply
    Pong = 7,
    /// Session refused
    Reject = 8,
}

// ─── Payloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    pub actor: ActorId,
    pub space: SpaceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub frontier: Frontier,
    /// Content digest of every document the sender knows.
    pub documents: BTreeMap<DocumentId, [u8; 32]>,
    /// The sender dropped buffered changes and wants everything past
    /// `frontier` again, even what was already streamed.
    pub resync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: u64,
    /// Individually encoded changes, dependencies first.
    pub changes: Vec<Vec<u8>>,
}

impl Batch {
    pub fn new<'a>(batch_id: u64, changes: impl IntoIterator<Item = &'a Change>) -> Result<Self, ChangeError> {
        let changes = changes
            .into_iter()
            .map(Change::encode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { batch_id, changes })
    }

    /// Decodes every change separately; a malformed entry does not affect
    /// the others.
    pub fn decode_changes(&self) -> impl Iterator<Item = Result<Change, ChangeError>> + '_ {
        self.changes.iter().map(|bytes| Change::decode(bytes))
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub batch_id: u64,
    /// Receiver's frontier after integrating the batch.
    pub frontier: Frontier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Done {
    pub frontier: Frontier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub reason: String,
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub space_id: SpaceId,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        peer_id: Uuid,
        space_id: SpaceId,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type,
            peer_id,
            space_id,
            payload,
        })
    }

    fn empty(msg_type: MessageType, peer_id: Uuid, space_id: SpaceId) -> Self {
        Self {
            msg_type,
            peer_id,
            space_id,
            payload: Vec::new(),
        }
    }

    pub fn hello(peer_id: Uuid, hello: &Hello) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Hello, peer_id, hello.space, hello)
    }

    pub fn announce(peer_id: Uuid, space_id: SpaceId, announce: &Announce) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Announce, peer_id, space_id, announce)
    }

    /// Create a batch message; the payload is LZ4-compressed.
    pub fn batch(peer_id: Uuid, space_id: SpaceId, batch: &Batch) -> Result<Self, ProtocolError> {
        let mut msg = Self::with_payload(MessageType::Batch, peer_id, space_id, batch)?;
        msg.payload = lz4_flex::compress_prepend_size(&msg.payload);
        Ok(msg)
    }

    pub fn ack(peer_id: Uuid, space_id: SpaceId, ack: &Ack) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Ack, peer_id, space_id, ack)
    }

    pub fn done(peer_id: Uuid, space_id: SpaceId, done: &Done) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Done, peer_id, space_id, done)
    }

    pub fn ping(peer_id: Uuid, space_id: SpaceId) -> Self {
        Self::empty(MessageType::Ping, peer_id, space_id)
    }

    pub fn pong(peer_id: Uuid, space_id: SpaceId) -> Self {
        Self::empty(MessageType::Pong, peer_id, space_id)
    }

    pub fn reject(peer_id: Uuid, space_id: SpaceId, reason: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::Reject,
            peer_id,
            space_id,
            &Reject { reason: reason.into() },
        )
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: DeserializeOwned>(&self, expected: MessageType, bytes: &[u8]) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                found: self.msg_type,
            });
        }
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    pub fn hello_payload(&self) -> Result<Hello, ProtocolError> {
        self.parse(MessageType::Hello, &self.payload)
    }

    pub fn announce_payload(&self) -> Result<Announce, ProtocolError> {
        self.parse(MessageType::Announce, &self.payload)
    }

    /// Decompress and parse a batch payload.
    pub fn batch_payload(&self) -> Result<Batch, ProtocolError> {
        if self.msg_type != MessageType::Batch {
            return Err(ProtocolError::InvalidMessageType {
                expected: MessageType::Batch,
                found: self.msg_type,
            });
        }
        // The size prefix is attacker-controlled; check it before allocating.
        let declared = self
            .payload
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(|| ProtocolError::CompressionError("truncated batch payload".into()))?;
        if declared > MAX_BATCH_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(declared));
        }
        let raw = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| ProtocolError::CompressionError(e.to_string()))?;
        self.parse(MessageType::Batch, &raw)
    }

    pub fn ack_payload(&self) -> Result<Ack, ProtocolError> {
        self.parse(MessageType::Ack, &self.payload)
    }

    pub fn done_payload(&self) -> Result<Done, ProtocolError> {
        self.parse(MessageType::Done, &self.payload)
    }

    pub fn reject_payload(&self) -> Result<Reject, ProtocolError> {
        self.parse(MessageType::Reject, &self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    PayloadTooLarge(usize),
    InvalidMessageType {
        expected: MessageType,
        found: MessageType,
    },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::CompressionError(e) => write!(f, "Compression error: {e}"),
            Self::PayloadTooLarge(n) => write!(f, "Payload of {n} bytes exceeds limit"),
            Self::InvalidMessageType { expected, found } => {
                write!(f, "Invalid message type: expected {expected:?}, found {found:?}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
