//! Transport-free sync session: the per-connection state machine.
//!
//! ```text
//!  Connecting ──handshake()──► SnapshotExchange ──SyncStep2──► Streaming
//!       │                             │                           │
//!       └──────── fail() / close() ───┴───────────────────────────┴──► Closed
//! ```
//!
//! The session owns a [`Replica`]. An observer registered on it encodes
//! every local update into the [`Outbox`]; the outbox is only released once
//! the room snapshot has been merged, so the first frames the relay sees
//! from us are never older than what the room already holds.
//!
//! Nothing here touches a socket: the caller feeds inbound frames to
//! [`SyncSession::handle_frame`] and writes whatever
//! [`SyncSession::take_outgoing`] returns.
//!
//! Reference: Kleppmann, Chapter 5, Replication

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use inkwell_core::{
    codec, ApplyReport, LocalOp, ObserverId, Replica, Shape, Transaction, UndoConfig, UndoError,
    Update,
};
use thiserror::Error;

use crate::protocol::{Compaction, MessageType, ProtocolError, RoomId, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    SnapshotExchange,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("sync task is no longer running")]
    TaskGone,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frames kept while not streaming before collapsing into a full-state publish
    pub outbox_capacity: usize,
    /// Frames published or merged before this replica compacts the room's
    /// relay backlog (0 disables)
    pub compact_after: usize,
    pub undo: UndoConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 10_000,
            compact_after: 500,
            undo: UndoConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    pub fn with_compact_after(mut self, frames: usize) -> Self {
        self.compact_after = frames;
        self
    }

    pub fn with_undo(mut self, undo: UndoConfig) -> Self {
        self.undo = undo;
        self
    }
}

/// Encoded frames waiting to be sent.
///
/// When the capacity is exceeded the queued frames are dropped and the
/// outbox is flagged as overflowed; the session then republishes the whole
/// document instead.
pub struct Outbox {
    queue: VecDeque<QueuedFrame>,
    max_size: usize,
    overflowed: bool,
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    clock: u64,
    bytes: Vec<u8>,
}

impl Outbox {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            overflowed: false,
        }
    }

    /// Queue an encoded frame. Returns false if the outbox overflowed.
    pub fn enqueue(&mut self, clock: u64, bytes: Vec<u8>) -> bool {
        if self.overflowed {
            return false;
        }
        if self.queue.len() >= self.max_size {
            log::warn!(
                "Outbox full at {} frames, falling back to a full-state publish",
                self.max_size
            );
            self.queue.clear();
            self.overflowed = true;
            return false;
        }
        self.queue.push_back(QueuedFrame { clock, bytes });
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).map(|frame| frame.bytes).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Highest clock queued.
    pub fn last_clock(&self) -> Option<u64> {
        self.queue.back().map(|frame| frame.clock)
    }

    /// Drop everything and reset the overflow flag.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.overflowed = false;
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|frame| frame.bytes.len()).sum()
    }
}

/// Visible change seen by the session's observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub local: bool,
    pub positions: Vec<usize>,
}

#[derive(Default)]
struct Shared {
    outbox: Option<Outbox>,
    changes: Vec<ChangeNotice>,
}

fn lock(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What an inbound frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Room snapshot merged; `skipped` frames failed to decode.
    Synced { report: ApplyReport, skipped: usize },
    Applied(ApplyReport),
    Pong,
    Ignored,
}

pub struct SyncSession {
    room: RoomId,
    replica: Replica,
    state: SessionState,
    shared: Arc<Mutex<Shared>>,
    observer: Option<ObserverId>,
    /// The replica already held state when the session began.
    had_state: bool,
    compact_after: usize,
    /// Frames that reached the room since our last compaction
    uncompacted: usize,
    last_error: Option<ConnectionError>,
}

impl SyncSession {
    pub fn new(room: RoomId, mut replica: Replica, config: &SessionConfig) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            outbox: Some(Outbox::new(config.outbox_capacity)),
            changes: Vec::new(),
        }));

        let sink = shared.clone();
        let observer = replica.observe(move |event| {
            let mut shared = lock(&sink);
            shared.changes.push(ChangeNotice {
                local: event.local,
                positions: event.affected_positions(),
            });
            if !event.local {
                return;
            }
            match SyncMessage::from_update(event.update).encode() {
                Ok(bytes) => {
                    if let Some(outbox) = shared.outbox.as_mut() {
                        outbox.enqueue(event.update.clock, bytes);
                    }
                }
                Err(e) => log::error!("Failed to encode local update: {e}"),
            }
        });

        let had_state = replica.document().has_history();
        Self {
            room,
            replica,
            state: SessionState::Connecting,
            shared,
            observer: Some(observer),
            had_state,
            compact_after: config.compact_after,
            uncompacted: 0,
            last_error: None,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn shapes(&self) -> Vec<Shape> {
        self.replica.shapes()
    }

    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    pub fn outbox_len(&self) -> usize {
        lock(&self.shared).outbox.as_ref().map_or(0, Outbox::len)
    }

    /// Transport is up: announce the room and ask for what we are missing.
    pub fn handshake(&mut self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if self.state != SessionState::Connecting {
            log::warn!("Handshake ignored in state {:?}", self.state);
            return Ok(Vec::new());
        }
        let origin = self.replica.actor().clone();
        let join = SyncMessage::join(origin.clone(), &self.room).encode()?;
        let step1 = SyncMessage::sync_step1(origin, self.replica.state_vector()).encode()?;
        self.state = SessionState::SnapshotExchange;
        log::debug!("Session for room {} waiting for snapshot", self.room);
        Ok(vec![join, step1])
    }

    /// Transport failed: stop observing and close.
    pub fn fail(&mut self, err: ConnectionError) {
        log::warn!("Session for room {} failed: {err}", self.room);
        self.detach_observer();
        self.state = SessionState::Closed;
        self.last_error = Some(err);
    }

    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<Inbound, ProtocolError> {
        if self.state == SessionState::Closed {
            return Ok(Inbound::Ignored);
        }
        let msg = SyncMessage::decode(bytes)?;
        match msg.msg_type {
            MessageType::SyncStep2 => self.merge_snapshot(&msg.payload),
            MessageType::Update => {
                let update = codec::decode(&msg.payload)?;
                Ok(Inbound::Applied(self.replica.apply_remote(&update)))
            }
            MessageType::Pong => Ok(Inbound::Pong),
            other => {
                log::debug!("Ignoring {other:?} from {}", msg.origin);
                Ok(Inbound::Ignored)
            }
        }
    }

    fn merge_snapshot(&mut self, payload: &[u8]) -> Result<Inbound, ProtocolError> {
        let frames = codec::snapshot_frames(payload)?;
        self.uncompacted += frames.len();
        let mut report = ApplyReport::default();
        let mut skipped = 0;
        for frame in frames {
            match codec::decode(frame) {
                Ok(update) => report.merge(self.replica.apply_remote(&update)),
                Err(e) => {
                    log::warn!("Skipping undecodable snapshot frame in room {}: {e}", self.room);
                    skipped += 1;
                }
            }
        }

        if self.state == SessionState::SnapshotExchange {
            self.publish_full_state_if_needed()?;
            self.state = SessionState::Streaming;
            log::info!(
                "Room {} synced: {} ops merged, {} frames skipped",
                self.room,
                report.integrated,
                skipped
            );
        }
        Ok(Inbound::Synced { report, skipped })
    }

    /// Replace queued frames with one full-state update when they may not
    /// cover everything the room is missing.
    fn publish_full_state_if_needed(&mut self) -> Result<(), ProtocolError> {
        let overflowed = lock(&self.shared).outbox.as_ref().is_some_and(Outbox::overflowed);
        if !self.had_state && !overflowed {
            return Ok(());
        }

        let snapshot = self.replica.stamped_snapshot();
        let mut frames = Vec::with_capacity(snapshot.updates.len());
        for update in snapshot.updates.iter().filter(|u| !u.is_empty()) {
            frames.push((update.clock, SyncMessage::from_update(update).encode()?));
        }

        let mut shared = lock(&self.shared);
        if let Some(outbox) = shared.outbox.as_mut() {
            outbox.clear();
            for (clock, bytes) in frames {
                outbox.enqueue(clock, bytes);
            }
        }
        self.had_state = false;
        log::info!("Republishing full state to room {}", self.room);
        Ok(())
    }

    /// Frames ready for the wire. Empty until the snapshot exchange is done.
    ///
    /// Once enough frames have gone through the room, a `Compact` message
    /// follows the drained updates.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        if self.state != SessionState::Streaming {
            return Vec::new();
        }
        let mut frames = lock(&self.shared).outbox.as_mut().map_or_else(Vec::new, Outbox::drain);
        self.uncompacted += frames.len();
        if self.compact_after > 0 && self.uncompacted >= self.compact_after {
            match self.compaction_frame() {
                Ok(frame) => frames.push(frame),
                Err(e) => log::error!("Failed to encode compaction for room {}: {e}", self.room),
            }
            self.uncompacted = 0;
        }
        frames
    }

    fn compaction_frame(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let snapshot = self.replica.stamped_snapshot();
        let clock = self.replica.document().clock();
        let compaction = Compaction::from_snapshot(self.replica.state_vector().clone(), &snapshot);
        log::debug!(
            "Compacting room {} under {clock}@{}",
            self.room,
            self.replica.actor()
        );
        SyncMessage::compact(self.replica.actor().clone(), clock, &compaction)?.encode()
    }

    /// Changes observed since the last call, local and remote.
    pub fn take_changes(&mut self) -> Vec<ChangeNotice> {
        std::mem::take(&mut lock(&self.shared).changes)
    }

    pub fn ping(&self) -> Result<Vec<u8>, ProtocolError> {
        SyncMessage::ping(self.replica.actor().clone()).encode()
    }

    pub fn apply_local(&mut self, op: LocalOp) -> Update {
        self.replica.apply_local(op)
    }

    pub fn transact<F>(&mut self, f: F) -> Update
    where
        F: FnOnce(&mut Transaction<'_>),
    {
        self.replica.transact(f)
    }

    pub fn undo(&mut self) -> Result<Update, UndoError> {
        self.replica.undo()
    }

    pub fn redo(&mut self) -> Result<Update, UndoError> {
        self.replica.redo()
    }

    pub fn stop_capturing(&mut self) {
        self.replica.stop_capturing();
    }

    fn detach_observer(&mut self) {
        if let Some(id) = self.observer.take() {
            self.replica.unobserve(id);
        }
        lock(&self.shared).outbox = None;
    }

    /// Unregister the observer, then hand the replica back for reuse.
    pub fn close(mut self) -> Replica {
        self.detach_observer();
        self.state = SessionState::Closed;
        log::debug!("Session for room {} closed", self.room);
        self.replica
    }
}
