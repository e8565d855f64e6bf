//! Binary envelope for relay traffic.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────────────────────┐
//! │ msg_type │ origin    │ clock    │ payload                  │
//! │ 1 byte   │ string    │ varint   │ length-prefixed bytes    │
//! └──────────┴───────────┴──────────┴──────────────────────────┘
//! ```
//!
//! | msg_type  | payload                                  |
//! |-----------|------------------------------------------|
//! | Join      | room id, UTF-8                           |
//! | SyncStep1 | encoded state vector of the requester    |
//! | SyncStep2 | snapshot container (relay → client)      |
//! | Update    | one encoded update frame                 |
//! | Ping/Pong | empty                                    |
//! | Compact   | sender's state vector + snapshot frames  |
//!
//! The message type comes first so the relay can route on it, and the
//! `(origin, clock)` stamp of an update is duplicated in the envelope so the
//! relay can track what each room holds without decoding the payload.
//! `Compact` lets a synced client hand the relay a snapshot that replaces
//! every backlog entry its state vector covers; the relay reads the state
//! vector but still treats the snapshot frames as opaque bytes.

use inkwell_core::{codec, ActorId, DecodeError, Snapshot, StateVector, Update};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on one envelope, payload included.
pub const MAX_MESSAGE_LEN: usize = 32 * 1024 * 1024;

/// Origin the relay stamps on the messages it produces itself.
pub const RELAY_ORIGIN: &str = "relay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Attach this connection to a room
    Join = 1,
    /// State vector request
    SyncStep1 = 2,
    /// Snapshot response
    SyncStep2 = 3,
    /// Incremental update
    Update = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
    /// Backlog compaction (client → relay)
    Compact = 7,
}

/// Opaque room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Payload of a `Compact` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compaction {
    /// Everything the sender had integrated when it took the snapshot
    pub covers: StateVector,
    /// Encoded update frames of the snapshot
    pub frames: Vec<Vec<u8>>,
}

impl Compaction {
    pub fn from_snapshot(covers: StateVector, snapshot: &Snapshot) -> Self {
        let frames = snapshot
            .updates
            .iter()
            .filter(|u| !u.is_empty())
            .map(codec::encode)
            .collect();
        Self { covers, frames }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub origin: ActorId,
    /// Lamport stamp of the carried update (0 for control messages)
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn control(msg_type: MessageType, origin: ActorId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            origin,
            clock: 0,
            payload,
        }
    }

    pub fn join(origin: ActorId, room: &RoomId) -> Self {
        Self::control(MessageType::Join, origin, room.as_str().as_bytes().to_vec())
    }

    pub fn sync_step1(origin: ActorId, state_vector: &StateVector) -> Self {
        Self::control(
            MessageType::SyncStep1,
            origin,
            codec::encode_state_vector(state_vector),
        )
    }

    /// Snapshot response carrying a snapshot container.
    pub fn sync_step2(origin: ActorId, snapshot: Vec<u8>) -> Self {
        Self::control(MessageType::SyncStep2, origin, snapshot)
    }

    /// Incremental update carrying one already encoded update frame.
    pub fn update(origin: ActorId, clock: u64, frame: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            origin,
            clock,
            payload: frame,
        }
    }

    /// Encode `update` and wrap it, copying its stamp into the envelope.
    pub fn from_update(update: &Update) -> Self {
        Self::update(update.origin.clone(), update.clock, codec::encode(update))
    }

    /// Compaction under the `(origin, clock)` stamp of the snapshot.
    pub fn compact(
        origin: ActorId,
        clock: u64,
        compaction: &Compaction,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(compaction, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Compact,
            origin,
            clock,
            payload,
        })
    }

    pub fn ping(origin: ActorId) -> Self {
        Self::control(MessageType::Ping, origin, Vec::new())
    }

    pub fn pong(origin: ActorId) -> Self {
        Self::control(MessageType::Pong, origin, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let config = bincode::config::standard().with_limit::<MAX_MESSAGE_LEN>();
        let (msg, _) = bincode::serde::decode_from_slice(bytes, config)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                found: self.msg_type,
            });
        }
        Ok(())
    }

    /// Parse the room of a `Join`.
    pub fn room(&self) -> Result<RoomId, ProtocolError> {
        self.expect_type(MessageType::Join)?;
        let name = std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::InvalidRoom)?;
        if name.is_empty() {
            return Err(ProtocolError::InvalidRoom);
        }
        Ok(RoomId::new(name))
    }

    /// Parse the payload of a `Compact`.
    pub fn compaction(&self) -> Result<Compaction, ProtocolError> {
        self.expect_type(MessageType::Compact)?;
        let config = bincode::config::standard().with_limit::<MAX_MESSAGE_LEN>();
        let (compaction, _) = bincode::serde::decode_from_slice(&self.payload, config)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(compaction)
    }

    /// Parse the state vector of a `SyncStep1`.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        self.expect_type(MessageType::SyncStep1)?;
        Ok(codec::decode_state_vector(&self.payload)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {found:?}")]
    InvalidMessageType {
        expected: MessageType,
        found: MessageType,
    },
    #[error("join carries no valid room id")]
    InvalidRoom,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
