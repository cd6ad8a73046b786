//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients, verifying the
//! full pipeline: join handshake, re-stamped op broadcast, sync gap fill,
//! snapshots, presence, rejection close codes, and persistence across
//! room lifetimes.

use std::sync::Arc;

use canvas_collab::client::{CollabClient, CollabEvent, ConnectionState};
use canvas_collab::protocol::{ClientMessage, CLOSE_ROOM_FULL, CLOSE_UNAUTHORIZED};
use canvas_collab::server::{AccessChecker, CollabConfig, CollabServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> CollabConfig {
    CollabConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_sessions_per_document: 10,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
        storage_path: None,
    }
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let server = CollabServer::new(test_config(port)).unwrap();
    spawn_server(server).await;
    port
}

async fn spawn_server(server: CollabServer) {
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Connect a client and drain events until the StateVector greeting.
async fn join(
    user_id: &str,
    username: &str,
    document_id: &str,
    url: &str,
) -> (CollabClient, mpsc::Receiver<CollabEvent>) {
    let mut client = CollabClient::new(user_id, username, document_id, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    loop {
        match timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("greeting within timeout")
            .expect("event stream open")
        {
            CollabEvent::StateVector(_) => break,
            CollabEvent::Connected | CollabEvent::UserJoined { .. } => continue,
            other => panic!("Unexpected event during join: {other:?}"),
        }
    }
    (client, events)
}

/// Wait for the next event matching the predicate, skipping others.
async fn wait_for<F, T>(events: &mut mpsc::Receiver<CollabEvent>, mut pred: F) -> T
where
    F: FnMut(CollabEvent) -> Option<T>,
{
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within timeout")
            .expect("event stream open");
        if let Some(value) = pred(event) {
            return value;
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_and_receives_state_vector() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = CollabClient::new("u1", "Alice", "doc-1", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(CollabEvent::Connected) => {}
        other => panic!("Expected Connected, got {other:?}"),
    }
    let sv = wait_for(&mut events, |e| match e {
        CollabEvent::StateVector(sv) => Some(sv),
        _ => None,
    })
    .await;
    assert_eq!(sv.document_id, "doc-1");
    assert_eq!(sv.version, 0);
    assert_eq!(sv.element_count, 0);

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_op_broadcast_between_clients() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut alice_events) = join("u1", "Alice", "doc-1", &url).await;
    let (_bob, mut bob_events) = join("u2", "Bob", "doc-1", &url).await;

    alice
        .add_element("e1", json!({"shape": "rect", "fill": "#fff"}))
        .await
        .unwrap();

    // Bob sees the re-stamped op.
    let (ops, version) = wait_for(&mut bob_events, |e| match e {
        CollabEvent::RemoteOps { ops, version, .. } => Some((ops, version)),
        _ => None,
    })
    .await;
    assert_eq!(version, 1);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].element_id, "e1");

    // Alice gets the authoritative ack too, with the server stamp.
    let (ack_ops, _) = wait_for(&mut alice_events, |e| match e {
        CollabEvent::RemoteOps { ops, version, .. } => Some((ops, version)),
        _ => None,
    })
    .await;
    assert_eq!(ack_ops[0].clock, ops[0].clock);
    assert_ne!(ack_ops[0].clock.node_id, alice.client_id().simple().to_string());
}

#[tokio::test]
async fn test_concurrent_writes_converge_via_server_order() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut alice_events) = join("u1", "Alice", "doc-1", &url).await;
    let (bob, mut bob_events) = join("u2", "Bob", "doc-1", &url).await;

    alice.add_element("e1", json!({})).await.unwrap();
    let _ = wait_for(&mut bob_events, |e| match e {
        CollabEvent::RemoteOps { .. } => Some(()),
        _ => None,
    })
    .await;

    // Both write the same property; the server's arrival order decides.
    alice.set("e1", "fill", json!("#aaa")).await.unwrap();
    bob.set("e1", "fill", json!("#bbb")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.snapshot_request().await.unwrap();
    bob.snapshot_request().await.unwrap();

    let snap_a = wait_for(&mut alice_events, |e| match e {
        CollabEvent::Snapshot(s) => Some(s),
        _ => None,
    })
    .await;
    let snap_b = wait_for(&mut bob_events, |e| match e {
        CollabEvent::Snapshot(s) => Some(s),
        _ => None,
    })
    .await;

    assert_eq!(snap_a.elements, snap_b.elements);
    let fill = &snap_a.elements["e1"]["fill"];
    assert!(fill == &json!("#aaa") || fill == &json!("#bbb"));
}

#[tokio::test]
async fn test_sync_request_fills_gap() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, _alice_events) = join("u1", "Alice", "doc-1", &url).await;
    alice.add_element("e1", json!({})).await.unwrap();
    alice.set("e1", "x", json!(10)).await.unwrap();
    alice.set("e1", "y", json!(20)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (bob, mut bob_events) = join("u2", "Bob", "doc-1", &url).await;
    bob.sync_request(0).await.unwrap();

    let (ops, version) = wait_for(&mut bob_events, |e| match e {
        CollabEvent::RemoteOps { ops, version, origin } if origin.is_none() => {
            Some((ops, version))
        }
        _ => None,
    })
    .await;
    assert_eq!(version, 3);
    assert_eq!(ops.len(), 3);

    // Partial gap: only the tail.
    bob.sync_request(2).await.unwrap();
    let (tail, _) = wait_for(&mut bob_events, |e| match e {
        CollabEvent::RemoteOps { ops, origin, version } if origin.is_none() => {
            Some((ops, version))
        }
        _ => None,
    })
    .await;
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].prop, "y");
}

#[tokio::test]
async fn test_snapshot_excludes_removed_elements() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut events) = join("u1", "Alice", "doc-1", &url).await;
    alice.add_element("e1", json!({"shape": "rect"})).await.unwrap();
    alice.add_element("e2", json!({"shape": "circle"})).await.unwrap();
    alice.remove_element("e1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.snapshot_request().await.unwrap();
    let snap = wait_for(&mut events, |e| match e {
        CollabEvent::Snapshot(s) => Some(s),
        _ => None,
    })
    .await;

    assert!(snap.elements.get("e1").is_none());
    assert_eq!(snap.elements["e2"]["shape"], json!("circle"));
    assert_eq!(snap.version, 3);
}

#[tokio::test]
async fn test_presence_fan_out() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, _alice_events) = join("u1", "Alice", "doc-1", &url).await;
    let (_bob, mut bob_events) = join("u2", "Bob", "doc-1", &url).await;

    alice
        .send_cursor(canvas_collab::presence::CursorPosition::new(120.0, 45.0))
        .await
        .unwrap();

    let (user_id, position) = wait_for(&mut bob_events, |e| match e {
        CollabEvent::CursorMoved { user_id, position, .. } => Some((user_id, position)),
        _ => None,
    })
    .await;
    assert_eq!(user_id, "u1");
    assert_eq!(position.x, 120.0);

    alice
        .send_presence(canvas_collab::presence::PresenceStatus::Editing)
        .await
        .unwrap();
    let status = wait_for(&mut bob_events, |e| match e {
        CollabEvent::PresenceChanged { status, .. } => Some(status),
        _ => None,
    })
    .await;
    assert_eq!(status, canvas_collab::presence::PresenceStatus::Editing);
}

#[tokio::test]
async fn test_join_leave_notifications() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (_alice, mut alice_events) = join("u1", "Alice", "doc-1", &url).await;
    let (mut bob, _bob_events) = join("u2", "Bob", "doc-1", &url).await;

    let joined = wait_for(&mut alice_events, |e| match e {
        CollabEvent::UserJoined { username, .. } => Some(username),
        _ => None,
    })
    .await;
    assert_eq!(joined, "Bob");

    bob.disconnect().await;
    let left = wait_for(&mut alice_events, |e| match e {
        CollabEvent::UserLeft { username, .. } => Some(username),
        _ => None,
    })
    .await;
    assert_eq!(left, "Bob");
}

struct DenyAll;

impl AccessChecker for DenyAll {
    fn has_access(&self, _document_id: &str, _user_id: &str) -> bool {
        false
    }
}

#[tokio::test]
async fn test_unauthorized_join_closes_with_4403() {
    let port = free_port().await;
    let server = CollabServer::with_access(test_config(port), Arc::new(DenyAll)).unwrap();
    spawn_server(server).await;

    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let join_msg = ClientMessage::Join {
        document_id: "doc-1".into(),
        user_id: "intruder".into(),
        username: "Mallory".into(),
    };
    ws.send(Message::Text(join_msg.encode().unwrap().into()))
        .await
        .unwrap();

    let close = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("Expected close frame, got {other:?}"),
            }
        }
    })
    .await
    .unwrap()
    .expect("close frame with reason");
    assert_eq!(close.code, CloseCode::Library(CLOSE_UNAUTHORIZED));
}

#[tokio::test]
async fn test_full_room_closes_with_4429() {
    let port = free_port().await;
    let server = CollabServer::new(CollabConfig {
        max_sessions_per_document: 1,
        ..test_config(port)
    })
    .unwrap();
    spawn_server(server).await;

    let url = format!("ws://127.0.0.1:{port}");
    let (_alice, _alice_events) = join("u1", "Alice", "doc-1", &url).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join_msg = ClientMessage::Join {
        document_id: "doc-1".into(),
        user_id: "u2".into(),
        username: "Bob".into(),
    };
    ws.send(Message::Text(join_msg.encode().unwrap().into()))
        .await
        .unwrap();

    let close = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("Expected close frame, got {other:?}"),
            }
        }
    })
    .await
    .unwrap()
    .expect("close frame with reason");
    assert_eq!(close.code, CloseCode::Library(CLOSE_ROOM_FULL));
}

#[tokio::test]
async fn test_malformed_frame_is_dropped_not_fatal() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join_msg = ClientMessage::Join {
        document_id: "doc-1".into(),
        user_id: "u1".into(),
        username: "Alice".into(),
    };
    ws.send(Message::Text(join_msg.encode().unwrap().into()))
        .await
        .unwrap();

    // Greeting proves the join went through.
    match timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
        Some(Ok(Message::Text(_))) => {}
        other => panic!("Expected greeting, got {other:?}"),
    }

    // Garbage must not kill the connection.
    ws.send(Message::Text("this is not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"action":"unknown_thing"}"#.into()))
        .await
        .unwrap();

    // A well-formed ping still gets answered.
    ws.send(Message::Text(ClientMessage::Ping.encode().unwrap().into()))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(_)) => continue,
                other => panic!("Expected pong, got {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert!(reply.contains("pong"));
}

#[tokio::test]
async fn test_document_persists_across_room_lifetimes() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let server = CollabServer::new(CollabConfig {
        storage_path: Some(dir.path().join("db")),
        ..test_config(port)
    })
    .unwrap();
    spawn_server(server).await;
    let url = format!("ws://127.0.0.1:{port}");

    // First lifetime: build some state, then leave (room closes, checkpoint).
    {
        let (alice, mut events) = join("u1", "Alice", "doc-1", &url).await;
        alice.add_element("e1", json!({"shape": "rect"})).await.unwrap();
        alice.set("e1", "fill", json!("#abc")).await.unwrap();
        // Wait for the acks so the ops are known to have been accepted.
        for _ in 0..2 {
            wait_for(&mut events, |e| match e {
                CollabEvent::RemoteOps { .. } => Some(()),
                _ => None,
            })
            .await;
        }
    }
    // Give the server time to close the room and checkpoint.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Second lifetime: a fresh client sees the restored document.
    let (bob, mut events) = join("u2", "Bob", "doc-1", &url).await;
    bob.snapshot_request().await.unwrap();
    let snap = wait_for(&mut events, |e| match e {
        CollabEvent::Snapshot(s) => Some(s),
        _ => None,
    })
    .await;
    assert_eq!(snap.version, 2);
    assert_eq!(snap.elements["e1"]["fill"], json!("#abc"));
}
