//! Rooms: relayed-update backlog plus fan-out to N-1 sessions.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! session gets an independent receiver buffering up to `capacity` frames;
//! a receiver that falls further behind is resynchronized from the backlog.
//!
//! ```text
//!             ┌──────────────── Room ────────────────┐
//!  frame ───► │ Mutex<RoomState>                     │
//!  compact ─► │   backlog: [(origin, clock, frames)] │──► snapshot_since(sv)
//!             │   sessions: {SessionId}              │
//!             │ broadcast::Sender<Arc<Relayed>> ─────┼──► session A, B, C
//!             └──────────────────────────────────────┘
//! ```
//!
//! Update payloads are stored and forwarded as opaque bytes; the relay
//! never decodes them. A client's `Compact` message folds the entries its
//! state vector covers into one snapshot entry, so the backlog tracks the
//! document rather than its whole edit history.
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use inkwell_core::{codec, ActorId, StateVector};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::{Compaction, ProtocolError, RoomId};

/// Identity of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("room {room} is full ({limit} sessions)")]
    RoomFull { room: RoomId, limit: usize },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame fanned out to the room, tagged with the session that sent it.
#[derive(Debug)]
pub struct Relayed {
    pub from: SessionId,
    pub frame: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
    pub backlog_len: usize,
    pub active_sessions: usize,
}

struct BacklogEntry {
    origin: ActorId,
    clock: u64,
    /// Encoded update frames, as received
    frames: Vec<Arc<Vec<u8>>>,
    /// Set on compaction entries: what their snapshot stands in for
    covers: Option<StateVector>,
}

impl BacklogEntry {
    /// Whether a replica that has integrated `seen` can do without this entry.
    fn seen_by(&self, seen: &StateVector) -> bool {
        seen.includes(&self.origin, self.clock)
            && self.covers.as_ref().map_or(true, |covers| seen.dominates(covers))
    }
}

struct RoomState {
    backlog: Vec<BacklogEntry>,
    sessions: HashSet<SessionId>,
}

pub struct Room {
    id: RoomId,
    state: Mutex<RoomState>,
    sender: broadcast::Sender<Arc<Relayed>>,
    capacity: usize,
    frames_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
}

impl Room {
    fn new(id: RoomId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            id,
            state: Mutex::new(RoomState {
                backlog: Vec::new(),
                sessions: HashSet::new(),
            }),
            sender,
            capacity,
            frames_relayed: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record an update in the backlog and forward `frame` to the room.
    ///
    /// Both happen under the room lock, so every session sees the room's
    /// frames in backlog order. Returns the number of receivers reached,
    /// the sender's own receiver included (it filters by session id).
    pub async fn relay(
        &self,
        from: SessionId,
        origin: ActorId,
        clock: u64,
        update: Vec<u8>,
        frame: Arc<Vec<u8>>,
    ) -> usize {
        let mut state = self.state.lock().await;
        state.backlog.push(BacklogEntry {
            origin,
            clock,
            frames: vec![Arc::new(update)],
            covers: None,
        });
        let bytes = frame.len() as u64;
        let count = self.sender.send(Arc::new(Relayed { from, frame })).unwrap_or(0);
        drop(state);

        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
        count
    }

    /// Replace every backlog entry `compaction.covers` accounts for with the
    /// compaction's snapshot frames. Nothing is forwarded: attached sessions
    /// already hold what the snapshot describes. Returns the number of
    /// entries dropped.
    pub async fn compact(&self, origin: ActorId, clock: u64, compaction: Compaction) -> usize {
        let Compaction { covers, frames } = compaction;
        let mut state = self.state.lock().await;
        let before = state.backlog.len();
        state.backlog.retain(|entry| !entry.seen_by(&covers));
        let dropped = before - state.backlog.len();
        state.backlog.push(BacklogEntry {
            origin,
            clock,
            frames: frames.into_iter().map(Arc::new).collect(),
            covers: Some(covers),
        });
        log::debug!(
            "Room {} compacted: {dropped} entries dropped, {} left",
            self.id,
            state.backlog.len()
        );
        dropped
    }

    /// Snapshot container holding every backlog entry `seen` does not cover.
    pub async fn snapshot_since(&self, seen: &StateVector) -> Vec<u8> {
        let state = self.state.lock().await;
        codec::frame_snapshot(
            state
                .backlog
                .iter()
                .filter(|entry| !entry.seen_by(seen))
                .flat_map(|entry| entry.frames.iter().map(|frame| frame.as_slice())),
        )
    }

    pub async fn full_snapshot(&self) -> Vec<u8> {
        self.snapshot_since(&StateVector::new()).await
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn has_session(&self, session: &SessionId) -> bool {
        self.state.lock().await.sessions.contains(session)
    }

    pub async fn backlog_len(&self) -> usize {
        self.state.lock().await.backlog.len()
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.state.lock().await;
        RoomStats {
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            backlog_len: state.backlog.len(),
            active_sessions: state.sessions.len(),
        }
    }
}

/// A session's membership in a room.
pub struct Attachment {
    pub room: Arc<Room>,
    pub receiver: broadcast::Receiver<Arc<Relayed>>,
}

/// Maps room ids to rooms. Rooms are created on first attach and released
/// when their last session detaches.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    broadcast_capacity: usize,
    max_peers_per_room: usize,
}

impl RoomRegistry {
    pub fn new(broadcast_capacity: usize, max_peers_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            max_peers_per_room,
        }
    }

    pub async fn attach(&self, room_id: &RoomId, session: SessionId) -> Result<Attachment, RelayError> {
        let mut rooms = self.rooms.write().await;
        let created = !rooms.contains_key(room_id);
        let room = rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(Room::new(room_id.clone(), self.broadcast_capacity)))
            .clone();

        let mut state = room.state.lock().await;
        if state.sessions.len() >= self.max_peers_per_room {
            let empty = state.sessions.is_empty();
            drop(state);
            if empty {
                rooms.remove(room_id);
            }
            return Err(RelayError::RoomFull {
                room: room_id.clone(),
                limit: self.max_peers_per_room,
            });
        }

        state.sessions.insert(session);
        // subscribe under the room lock so no relayed frame falls between
        // the backlog and the receiver
        let receiver = room.sender.subscribe();
        drop(state);

        if created {
            log::info!("Room {room_id} created");
        }
        Ok(Attachment { room, receiver })
    }

    /// Remove `session` from the room. Returns true when the room was released.
    pub async fn detach(&self, room_id: &RoomId, session: SessionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };

        let mut state = room.state.lock().await;
        state.sessions.remove(&session);
        if !state.sessions.is_empty() {
            return false;
        }
        drop(state);

        rooms.remove(room_id);
        log::info!("Room {room_id} released (empty)");
        true
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
