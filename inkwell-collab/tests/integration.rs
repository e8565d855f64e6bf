//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real relay and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use inkwell_collab::client::{ClientConfig, SyncClient, SyncEvent};
use inkwell_collab::protocol::{MessageType, RoomId, SyncMessage};
use inkwell_collab::server::{RelayServer, ServerConfig};
use inkwell_collab::session::{ConnectionError, SessionConfig, SessionState};
use inkwell_core::{ActorId, Color, LocalOp, Point, Rect, Replica, Shape};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on an ephemeral port, return it with its URL.
async fn start_test_server() -> (Arc<RelayServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig::new(format!("127.0.0.1:{port}"))
        .with_max_peers_per_room(10)
        .with_broadcast_capacity(64);
    let server = Arc::new(RelayServer::new(config));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn rect(id: &str, x: f32) -> Shape {
    Shape::rect(id, Color::default(), Rect::new(x, 0.0, 10.0, 10.0))
}

/// Connect a fresh replica to `room` and wait until its snapshot is merged.
async fn join(url: &str, room: &str, actor: &str) -> (SyncClient, UnboundedReceiver<SyncEvent>) {
    join_with(url, room, Replica::new(ActorId::from(actor))).await
}

async fn join_with(
    url: &str,
    room: &str,
    replica: Replica,
) -> (SyncClient, UnboundedReceiver<SyncEvent>) {
    let mut client = SyncClient::new(ClientConfig::new(url, RoomId::from(room)), replica);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { .. })).await;
    (client, events)
}

/// Receive events until one matches, failing after two seconds.
async fn wait_for(
    events: &mut UnboundedReceiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll until `client` shows `expected` shapes.
async fn wait_for_len(client: &SyncClient, expected: usize) -> Vec<Shape> {
    timeout(Duration::from_secs(2), async {
        loop {
            let shapes = client.shapes().await.unwrap();
            if shapes.len() == expected {
                return shapes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for shapes")
}

#[tokio::test]
async fn test_client_connects_and_syncs_empty_room() {
    let (server, url) = start_test_server().await;
    let (client, _events) = join(&url, "board", "alice").await;

    assert_eq!(client.connection_state().await, SessionState::Streaming);
    assert!(client.shapes().await.unwrap().is_empty());

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_rooms, 1);
}

#[tokio::test]
async fn test_edits_reach_the_other_client() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = join(&url, "board", "alice").await;
    let (bob, mut bob_events) = join(&url, "board", "bob").await;

    alice.apply(LocalOp::Push(rect("r1", 0.0))).await.unwrap();

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, SyncEvent::Changed { local: false, .. })
    })
    .await;
    assert_eq!(
        event,
        SyncEvent::Changed {
            local: false,
            positions: vec![0]
        }
    );
    assert_eq!(bob.shapes().await.unwrap(), alice.shapes().await.unwrap());
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (_server, url) = start_test_server().await;
    let (alice, _a) = join(&url, "board", "alice").await;
    let (bob, _b) = join(&url, "board", "bob").await;

    alice.apply(LocalOp::Push(rect("r1", 0.0))).await.unwrap();
    wait_for_len(&bob, 1).await;

    // both drag the same rectangle at once
    let moved_by_alice = rect("r1", 0.0).drag_to(Point::new(50.0, 50.0));
    let moved_by_bob = rect("r1", 0.0).drag_to(Point::new(80.0, 20.0));
    alice.apply(LocalOp::ReplaceAt(0, moved_by_alice)).await.unwrap();
    bob.apply(LocalOp::ReplaceAt(0, moved_by_bob)).await.unwrap();
    bob.apply(LocalOp::Push(rect("r2", 30.0))).await.unwrap();

    let alice_shapes = wait_for_len(&alice, 3).await;
    let bob_shapes = wait_for_len(&bob, 3).await;
    assert_eq!(alice_shapes, bob_shapes);
}

#[tokio::test]
async fn test_late_joiner_receives_backlog() {
    let (_server, url) = start_test_server().await;
    let (alice, _a) = join(&url, "board", "alice").await;
    let (observer, _o) = join(&url, "board", "observer").await;

    for i in 0..3 {
        alice
            .apply(LocalOp::Push(rect(&format!("r{i}"), i as f32)))
            .await
            .unwrap();
    }
    alice.apply(LocalOp::DeleteAt(1)).await.unwrap();
    // the observer seeing the edits means the relay holds them
    let expected = alice.shapes().await.unwrap();
    timeout(Duration::from_secs(2), async {
        while observer.shapes().await.unwrap() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("observer never caught up");

    let (carol, _c) = join(&url, "board", "carol").await;
    let shapes = carol.shapes().await.unwrap();
    assert_eq!(shapes, alice.shapes().await.unwrap());
    assert_eq!(shapes.len(), 2);
}

#[tokio::test]
async fn test_edits_before_sync_are_delivered() {
    let (_server, url) = start_test_server().await;

    let mut alice = SyncClient::new(
        ClientConfig::new(&url, RoomId::from("board")),
        Replica::new(ActorId::from("alice")),
    );
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    alice.apply(LocalOp::Push(rect("early", 0.0))).await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Synced { .. })).await;

    let (bob, _b) = join(&url, "board", "bob").await;
    let shapes = wait_for_len(&bob, 1).await;
    assert_eq!(shapes[0].id().0, "early");
}

#[tokio::test]
async fn test_room_isolation() {
    let (server, url) = start_test_server().await;
    let (alice, _a) = join(&url, "room-a", "alice").await;
    let (bob, _b) = join(&url, "room-b", "bob").await;
    let (carol, _c) = join(&url, "room-a", "carol").await;

    alice.apply(LocalOp::Push(rect("r1", 0.0))).await.unwrap();
    wait_for_len(&carol, 1).await;

    assert!(bob.shapes().await.unwrap().is_empty());
    assert_eq!(server.registry().room_count().await, 2);
}

#[tokio::test]
async fn test_undo_propagates() {
    let (_server, url) = start_test_server().await;
    let (alice, _a) = join(&url, "board", "alice").await;
    let (bob, _b) = join(&url, "board", "bob").await;

    alice.apply(LocalOp::Push(rect("r1", 0.0))).await.unwrap();
    wait_for_len(&bob, 1).await;

    assert!(alice.undo().await.unwrap().is_some());
    wait_for_len(&bob, 0).await;

    assert!(alice.redo().await.unwrap().is_some());
    wait_for_len(&bob, 1).await;

    // bob has nothing of his own to undo
    assert_eq!(bob.undo().await.unwrap(), None);
}

#[tokio::test]
async fn test_close_hands_back_replica_for_reconnect() {
    let (_server, url) = start_test_server().await;
    let (alice, mut alice_events) = join(&url, "board", "alice").await;
    alice.apply(LocalOp::Push(rect("r1", 0.0))).await.unwrap();

    let replica = alice.close().await.unwrap();
    assert_eq!(replica.shapes().len(), 1);
    wait_for(&mut alice_events, |e| {
        matches!(e, SyncEvent::Disconnected { reason: None })
    })
    .await;

    let (alice, _a) = join_with(&url, "board", replica).await;
    assert_eq!(alice.shapes().await.unwrap().len(), 1);

    let (bob, _b) = join(&url, "board", "bob").await;
    assert_eq!(bob.shapes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_connect_failure_reports_disconnected() {
    let port = free_port().await;
    let mut client = SyncClient::new(
        ClientConfig::new(format!("ws://127.0.0.1:{port}"), RoomId::from("board")),
        Replica::new(ActorId::from("alice")),
    );
    let mut events = client.take_event_rx().unwrap();

    let result = client.connect().await;
    assert!(matches!(result, Err(ConnectionError::Connect { .. })));
    assert_eq!(client.connection_state().await, SessionState::Closed);

    let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
    assert!(matches!(
        event,
        Some(SyncEvent::Disconnected { reason: Some(_) })
    ));

    // the replica is still ours
    let replica = client.close().await.unwrap();
    assert_eq!(replica.actor(), &ActorId::from("alice"));
}

#[tokio::test]
async fn test_ping_pong() {
    let (_server, url) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let ping = SyncMessage::ping(ActorId::from("probe")).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(data) = reply else {
        panic!("expected a binary frame, got {reply:?}");
    };
    let pong = SyncMessage::decode(&data).unwrap();
    assert_eq!(pong.msg_type, MessageType::Pong);
}

#[tokio::test]
async fn test_malformed_envelope_is_ignored() {
    let (server, url) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Binary(vec![0xFF, 0x00, 0x13, 0x37].into()))
        .await
        .unwrap();
    let ping = SyncMessage::ping(ActorId::from("probe")).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    // the connection survives and still answers
    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(data) = reply else {
        panic!("expected a binary frame, got {reply:?}");
    };
    assert_eq!(SyncMessage::decode(&data).unwrap().msg_type, MessageType::Pong);
    assert_eq!(server.stats().await.rejected_messages, 1);
}

#[tokio::test]
async fn test_update_before_join_is_rejected() {
    let (server, url) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let mut replica = Replica::new(ActorId::from("rogue"));
    let update = replica.apply_local(LocalOp::Push(rect("r1", 0.0)));
    let envelope = SyncMessage::from_update(&update).encode().unwrap();
    ws.send(Message::Binary(envelope.into())).await.unwrap();
    let ping = SyncMessage::ping(ActorId::from("rogue")).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(server.stats().await.rejected_messages, 1);
    assert_eq!(server.registry().room_count().await, 0);
}

#[tokio::test]
async fn test_room_name_with_space_and_slash() {
    let (server, url) = start_test_server().await;
    let (alice, _a) = join(&url, "my board/2024", "alice").await;
    let (bob, _b) = join(&url, "my board/2024", "bob").await;
    let (carol, _c) = join(&url, "my board", "carol").await;

    alice.apply(LocalOp::Push(rect("r1", 0.0))).await.unwrap();
    wait_for_len(&bob, 1).await;
    assert!(carol.shapes().await.unwrap().is_empty());

    let mut rooms = server.registry().active_rooms().await;
    rooms.sort();
    assert_eq!(rooms, vec![RoomId::from("my board"), RoomId::from("my board/2024")]);
}

#[tokio::test]
async fn test_drag_history_is_compacted_on_the_relay() {
    let (server, url) = start_test_server().await;
    let session = SessionConfig::default().with_compact_after(50);
    let mut alice = SyncClient::new(
        ClientConfig::new(&url, RoomId::from("board")).with_session(session),
        Replica::new(ActorId::from("alice")),
    );
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Synced { .. })).await;

    alice.apply(LocalOp::Push(rect("r1", 0.0))).await.unwrap();
    for step in 1..=200 {
        let moved = rect("r1", 0.0).drag_to(Point::new(step as f32, 0.0));
        alice.apply(LocalOp::ReplaceAt(0, moved)).await.unwrap();
    }
    let expected = alice.shapes().await.unwrap();

    // 201 updates, compacted after every 50
    let room = server.registry().get(&RoomId::from("board")).await.unwrap();
    timeout(Duration::from_secs(2), async {
        loop {
            let stats = room.stats().await;
            let compactions = server.stats().await.compactions;
            if stats.frames_relayed == 201 && compactions == 4 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay backlog never compacted");
    assert_eq!(room.backlog_len().await, 2);

    let (carol, _c) = join(&url, "board", "carol").await;
    assert_eq!(carol.shapes().await.unwrap(), expected);
}
