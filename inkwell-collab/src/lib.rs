//! # inkwell-collab: Networked sync for the Inkwell canvas
//!
//! Carries [`inkwell_core`] updates between replicas through a relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ RelayServer │
//! │ (per user)  │   SyncMessage env.  │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ SyncSession │                     │ RoomRegistry│
//! │ (sans-io)   │                     │ backlog +   │
//! └──────┬──────┘                     │ fan-out     │
//!        ▼                            └─────────────┘
//! ┌─────────────┐
//! │ Replica     │
//! └─────────────┘
//! ```
//!
//! The relay never decodes update payloads: it routes on the envelope,
//! keeps an append-only backlog per room and answers state-vector requests
//! with the backlog frames the requester has not observed.
//!
//! ## Modules
//!
//! - [`protocol`]: Envelope wire format (bincode-encoded SyncMessage)
//! - [`session`]: Sans-io sync state machine around a replica
//! - [`room`]: Room registry, backlog and fan-out
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket client driving a session

pub mod client;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;

pub use client::{ClientConfig, SyncClient, SyncEvent};
pub use protocol::{Compaction, MessageType, ProtocolError, RoomId, SyncMessage};
pub use room::{RelayError, Room, RoomRegistry, RoomStats, SessionId};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{
    ChangeNotice, ConnectionError, Inbound, Outbox, SessionConfig, SessionState, SyncSession,
};
