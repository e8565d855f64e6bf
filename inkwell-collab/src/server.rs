//! WebSocket relay server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── backlog (opaque update frames)
//!            ├── Join(room) ── Room ──┤
//! Client B ──┘                        └── broadcast ──┬──► Client A (skipped: sender)
//!                                                     ├──► Client B
//!                                                     └──► Client C
//! ```
//!
//! The relay holds no document. It routes on the envelope only:
//! - `Join` attaches the connection to a room (created lazily)
//! - `SyncStep1` is answered with the backlog the requester has not seen
//! - `Update` is appended to the backlog and forwarded to the other sessions
//! - `Ping` is answered with `Pong`
//!
//! A malformed envelope is counted and dropped; the connection and every
//! other room carry on.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use inkwell_core::ActorId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{MessageType, SyncMessage, RELAY_ORIGIN};
use crate::room::{RelayError, Relayed, Room, RoomRegistry, SessionId};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_max_peers_per_room(mut self, max: usize) -> Self {
        self.max_peers_per_room = max;
        self
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Defaults overridden by `INKWELL_BIND_ADDR`, `INKWELL_BROADCAST_CAPACITY`
    /// and `INKWELL_MAX_PEERS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("INKWELL_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(capacity) = parse_var(&lookup, "INKWELL_BROADCAST_CAPACITY") {
            config.broadcast_capacity = capacity;
        }
        if let Some(max) = parse_var(&lookup, "INKWELL_MAX_PEERS") {
            config.max_peers_per_room = max;
        }
        config
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {key}={raw}: {e}");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    /// Envelopes that failed to decode or arrived out of place
    pub rejected_messages: u64,
    /// Full snapshots sent to sessions whose receiver lagged
    pub lagged_resyncs: u64,
    /// Backlog compactions applied
    pub compactions: u64,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let session = SessionId::new();
        let relay_origin = ActorId::from(RELAY_ORIGIN);
        let mut room: Option<Arc<Room>> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Relayed>>> = None;

        let result: Result<(), RelayError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };

                    let bytes: Vec<u8> = data.into();
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += bytes.len() as u64;
                    }

                    let sync_msg = match SyncMessage::decode(&bytes) {
                        Ok(sync_msg) => sync_msg,
                        Err(e) => {
                            log::warn!("Dropping malformed envelope from {addr}: {e}");
                            stats.write().await.rejected_messages += 1;
                            continue;
                        }
                    };

                    let attached = room.clone();
                    let reply = match (sync_msg.msg_type, attached.as_ref()) {
                        (MessageType::Join, None) => {
                            let room_id = match sync_msg.room() {
                                Ok(room_id) => room_id,
                                Err(e) => {
                                    log::warn!("Rejected join from {addr}: {e}");
                                    stats.write().await.rejected_messages += 1;
                                    continue;
                                }
                            };
                            match registry.attach(&room_id, session).await {
                                Ok(attachment) => {
                                    log::info!("{} joined room {room_id} from {addr}", sync_msg.origin);
                                    room = Some(attachment.room);
                                    broadcast_rx = Some(attachment.receiver);
                                    stats.write().await.active_rooms = registry.room_count().await;
                                    None
                                }
                                Err(e) => {
                                    log::warn!("Refusing {addr}: {e}");
                                    break Ok(());
                                }
                            }
                        }

                        (MessageType::SyncStep1, Some(current)) => match sync_msg.state_vector() {
                            Ok(seen) => {
                                let snapshot = current.snapshot_since(&seen).await;
                                Some(SyncMessage::sync_step2(relay_origin.clone(), snapshot))
                            }
                            Err(e) => {
                                log::warn!("Rejected state vector from {addr}: {e}");
                                stats.write().await.rejected_messages += 1;
                                None
                            }
                        },

                        (MessageType::Update, Some(current)) => {
                            let SyncMessage { origin, clock, payload, .. } = sync_msg;
                            log::debug!("Relaying {}@{origin} in room {}", clock, current.id());
                            current.relay(session, origin, clock, payload, Arc::new(bytes)).await;
                            None
                        }

                        (MessageType::Compact, Some(current)) => match sync_msg.compaction() {
                            Ok(compaction) => {
                                let dropped = current
                                    .compact(sync_msg.origin, sync_msg.clock, compaction)
                                    .await;
                                stats.write().await.compactions += 1;
                                log::debug!("Compaction from {addr} dropped {dropped} entries");
                                None
                            }
                            Err(e) => {
                                log::warn!("Rejected compaction from {addr}: {e}");
                                stats.write().await.rejected_messages += 1;
                                None
                            }
                        },

                        (MessageType::Ping, _) => Some(SyncMessage::pong(relay_origin.clone())),

                        (MessageType::Pong, _) => None,

                        (msg_type, _) => {
                            log::warn!("Unexpected {msg_type:?} from {addr}");
                            stats.write().await.rejected_messages += 1;
                            None
                        }
                    };

                    if let Some(reply) = reply {
                        if let Err(e) = Self::send(&mut ws_sender, &reply).await {
                            break Err(e);
                        }
                    }
                }

                msg = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // not attached yet
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(relayed) => {
                            if relayed.from == session {
                                continue;
                            }
                            let frame = relayed.frame.as_ref().clone();
                            if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                                break Err(e.into());
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Session {session} lagged by {n} frames, resending snapshot");
                            stats.write().await.lagged_resyncs += 1;
                            if let Some(current) = &room {
                                let snapshot = current.full_snapshot().await;
                                let reply = SyncMessage::sync_step2(relay_origin.clone(), snapshot);
                                if let Err(e) = Self::send(&mut ws_sender, &reply).await {
                                    break Err(e);
                                }
                            }
                        }
                        Err(RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        if let Some(current) = &room {
            registry.detach(current.id(), session).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = registry.room_count().await;
        }

        result
    }

    async fn send<S>(sink: &mut S, msg: &SyncMessage) -> Result<(), RelayError>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let encoded = msg.encode()?;
        sink.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}
