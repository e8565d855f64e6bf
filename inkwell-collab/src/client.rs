//! WebSocket sync client: drives a [`SyncSession`] over tokio-tungstenite.
//!
//! ```text
//!   UI ── Command (mpsc) ──┐
//!                          ▼
//!                   ┌─ sync task ─┐ ◄── frames ── WebSocket
//!                   │ SyncSession │ ─── frames ──► WebSocket
//!                   └─────────────┘
//!                          │
//!   UI ◄── SyncEvent ──────┘
//! ```
//!
//! One spawned task owns the session, so store mutations, observer
//! callbacks and network I/O are serialized on a single loop. A transport
//! failure closes the session and surfaces `Disconnected`; the task keeps
//! answering commands offline so the replica can still be edited and
//! reclaimed with [`SyncClient::close`]. There is no automatic retry.
//!
//! Reference: Kleppmann, Chapter 5, Replication

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use inkwell_core::{ActorId, LocalOp, Replica, Shape, UndoError, Update};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::RoomId;
use crate::session::{ConnectionError, Inbound, SessionConfig, SessionState, SyncSession};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:1234`
    pub server_url: String,
    pub room: RoomId,
    pub session: SessionConfig,
    /// Pending UI commands before senders wait
    pub command_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:1234".to_string(),
            room: RoomId::from("default"),
            session: SessionConfig::default(),
            command_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, room: RoomId) -> Self {
        Self {
            server_url: server_url.into(),
            room,
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity;
        self
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Transport up, handshake sent
    Connected,
    /// Room snapshot merged; queued local edits are being flushed
    Synced { shapes: usize, skipped_frames: usize },
    /// The materialized sequence changed
    Changed { local: bool, positions: Vec<usize> },
    /// An inbound frame was rejected and dropped
    Rejected { reason: String },
    /// Session closed; `None` when closed on request
    Disconnected { reason: Option<String> },
}

enum Command {
    Apply(LocalOp, oneshot::Sender<Update>),
    Undo(oneshot::Sender<Result<Update, UndoError>>),
    Redo(oneshot::Sender<Result<Update, UndoError>>),
    StopCapturing,
    Shapes(oneshot::Sender<Vec<Shape>>),
    Ping,
    Close(oneshot::Sender<Replica>),
}

/// The sync client.
pub struct SyncClient {
    actor: ActorId,
    config: ClientConfig,
    state: Arc<RwLock<SessionState>>,
    /// Replica held until the session task takes it over
    pending: Option<Replica>,
    commands: Option<mpsc::Sender<Command>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, replica: Replica) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            actor: replica.actor().clone(),
            config,
            state: Arc::new(RwLock::new(SessionState::Connecting)),
            pending: Some(replica),
            commands: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay and start the sync task.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        let Some(replica) = self.pending.take() else {
            return Err(ConnectionError::AlreadyConnected);
        };
        *self.state.write().await = SessionState::Connecting;

        // the room travels in the Join envelope, never in the URL
        let url = self.config.server_url.clone();
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                let err = ConnectionError::Connect {
                    url,
                    reason: e.to_string(),
                };
                return Err(self.abort(replica, err).await);
            }
        };

        let mut session = SyncSession::new(self.config.room.clone(), replica, &self.config.session);
        let (mut writer, reader) = ws_stream.split();

        let handshake = match session.handshake() {
            Ok(frames) => frames,
            Err(e) => return Err(self.abort(session.close(), e.into()).await),
        };
        for frame in handshake {
            if let Err(e) = writer.send(Message::Binary(frame.into())).await {
                let err = ConnectionError::Transport(e.to_string());
                return Err(self.abort(session.close(), err).await);
            }
        }

        *self.state.write().await = session.state();
        let _ = self.event_tx.send(SyncEvent::Connected);
        log::info!("{} connected to room {}", self.actor, self.config.room);

        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity.max(1));
        self.commands = Some(command_tx);
        tokio::spawn(drive(
            session,
            writer,
            reader,
            command_rx,
            self.state.clone(),
            self.event_tx.clone(),
        ));
        Ok(())
    }

    async fn abort(&mut self, replica: Replica, err: ConnectionError) -> ConnectionError {
        log::error!("{} could not join room {}: {err}", self.actor, self.config.room);
        self.pending = Some(replica);
        *self.state.write().await = SessionState::Closed;
        let _ = self.event_tx.send(SyncEvent::Disconnected {
            reason: Some(err.to_string()),
        });
        err
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let commands = self.commands.as_ref().ok_or(ConnectionError::NotConnected)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(make(reply_tx))
            .await
            .map_err(|_| ConnectionError::TaskGone)?;
        reply_rx.await.map_err(|_| ConnectionError::TaskGone)
    }

    async fn notify(&self, command: Command) -> Result<(), ConnectionError> {
        let commands = self.commands.as_ref().ok_or(ConnectionError::NotConnected)?;
        commands.send(command).await.map_err(|_| ConnectionError::TaskGone)
    }

    /// Apply a UI mutation; it is transmitted once the session is streaming.
    pub async fn apply(&self, op: LocalOp) -> Result<Update, ConnectionError> {
        self.request(|reply| Command::Apply(op, reply)).await
    }

    /// Undo the last local entry. `None` when there is nothing to undo.
    pub async fn undo(&self) -> Result<Option<Update>, ConnectionError> {
        Ok(self.request(Command::Undo).await?.ok())
    }

    pub async fn redo(&self) -> Result<Option<Update>, ConnectionError> {
        Ok(self.request(Command::Redo).await?.ok())
    }

    /// End the current undo capture group (e.g. on pointer up).
    pub async fn stop_capturing(&self) -> Result<(), ConnectionError> {
        self.notify(Command::StopCapturing).await
    }

    pub async fn shapes(&self) -> Result<Vec<Shape>, ConnectionError> {
        self.request(Command::Shapes).await
    }

    pub async fn send_ping(&self) -> Result<(), ConnectionError> {
        self.notify(Command::Ping).await
    }

    /// Close the session and hand the replica back.
    pub async fn close(mut self) -> Result<Replica, ConnectionError> {
        if let Some(replica) = self.pending.take() {
            *self.state.write().await = SessionState::Closed;
            return Ok(replica);
        }
        self.request(Command::Close).await
    }

    pub async fn connection_state(&self) -> SessionState {
        *self.state.read().await
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn room(&self) -> &RoomId {
        &self.config.room
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }
}

/// Handle one command. Returns the reply channel of a close request.
fn handle_command(session: &mut SyncSession, command: Command) -> Option<oneshot::Sender<Replica>> {
    match command {
        Command::Apply(op, reply) => {
            let _ = reply.send(session.apply_local(op));
        }
        Command::Undo(reply) => {
            let _ = reply.send(session.undo());
        }
        Command::Redo(reply) => {
            let _ = reply.send(session.redo());
        }
        Command::StopCapturing => session.stop_capturing(),
        Command::Shapes(reply) => {
            let _ = reply.send(session.shapes());
        }
        Command::Ping => {}
        Command::Close(reply) => return Some(reply),
    }
    None
}

fn emit_changes(session: &mut SyncSession, events: &mpsc::UnboundedSender<SyncEvent>) {
    for notice in session.take_changes() {
        let _ = events.send(SyncEvent::Changed {
            local: notice.local,
            positions: notice.positions,
        });
    }
}

/// The sync task: owns the session until close or until the UI side drops.
async fn drive(
    mut session: SyncSession,
    mut writer: WsWriter,
    mut reader: WsReader,
    mut commands: mpsc::Receiver<Command>,
    state: Arc<RwLock<SessionState>>,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    let failure: Option<ConnectionError> = 'run: loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    // client dropped
                    let _ = writer.send(Message::Close(None)).await;
                    break 'run None;
                };
                if matches!(command, Command::Ping) {
                    match session.ping() {
                        Ok(ping) => {
                            if let Err(e) = writer.send(Message::Binary(ping.into())).await {
                                break 'run Some(ConnectionError::Transport(e.to_string()));
                            }
                        }
                        Err(e) => log::warn!("Failed to encode ping: {e}"),
                    }
                }
                if let Some(reply) = handle_command(&mut session, command) {
                    let _ = writer.send(Message::Close(None)).await;
                    emit_changes(&mut session, &events);
                    *state.write().await = SessionState::Closed;
                    let _ = reply.send(session.close());
                    let _ = events.send(SyncEvent::Disconnected { reason: None });
                    return;
                }
            }

            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match session.handle_frame(&bytes) {
                            Ok(Inbound::Synced { report, skipped }) => {
                                *state.write().await = session.state();
                                log::debug!("Snapshot merged: {} ops integrated", report.integrated);
                                let _ = events.send(SyncEvent::Synced {
                                    shapes: session.replica().document().len(),
                                    skipped_frames: skipped,
                                });
                            }
                            Ok(_) => {}
                            Err(e) => {
                                log::warn!("Rejected frame in room {}: {e}", session.room());
                                let _ = events.send(SyncEvent::Rejected { reason: e.to_string() });
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break 'run Some(ConnectionError::Closed),
                    Some(Err(e)) => break 'run Some(ConnectionError::Transport(e.to_string())),
                    Some(Ok(_)) => {}
                }
            }
        }

        emit_changes(&mut session, &events);
        for frame in session.take_outgoing() {
            if let Err(e) = writer.send(Message::Binary(frame.into())).await {
                break 'run Some(ConnectionError::Transport(e.to_string()));
            }
        }
    };

    let reason = failure.as_ref().map(ToString::to_string);
    if let Some(err) = failure {
        session.fail(err);
    }
    *state.write().await = SessionState::Closed;
    let _ = events.send(SyncEvent::Disconnected { reason });

    // offline: keep serving the UI until it closes or drops the client
    while let Some(command) = commands.recv().await {
        if let Some(reply) = handle_command(&mut session, command) {
            let _ = reply.send(session.close());
            return;
        }
        emit_changes(&mut session, &events);
    }
}
