//! End-to-end protocol tests: a real server, raw WebSocket clients.
//!
//! Each test starts a server on a free port, speaks the binary protocol
//! directly and verifies the full pipeline — join handshake, submit with
//! rebase, broadcast fan-out, catch-up and presence relay.

use chorus_collab::config::CollabConfig;
use chorus_collab::external::{AllowAll, MemoryContentStore};
use chorus_collab::protocol::{
    ClientMessage, ComponentDto, CursorPositionDto, ErrorCode, ServerMessage, SubmitDto,
};
use chorus_collab::server::{ServerConfig, SyncServer};

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestHarness {
    url: String,
    content: Arc<MemoryContentStore>,
    _storage: TempDir,
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port with an empty in-memory content store.
async fn start_test_server() -> TestHarness {
    let port = free_port().await;
    let storage = tempfile::tempdir().unwrap();
    let content = Arc::new(MemoryContentStore::new());

    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        storage_path: storage.path().join("oplog"),
        collab: CollabConfig::for_testing(),
    };
    let server = SyncServer::new(config, Arc::new(AllowAll), content.clone()).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestHarness {
        url: format!("ws://127.0.0.1:{port}"),
        content,
        _storage: storage,
    }
}

async fn connect(url: &str) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut WsClient, msg: &ClientMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Receive the next binary protocol message, with a deadline.
async fn recv(ws: &mut WsClient) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Binary(data) = frame {
            let bytes: Vec<u8> = data.into();
            return ServerMessage::decode(&bytes).unwrap();
        }
    }
}

/// Join a document and return the join reply.
async fn join(ws: &mut WsClient, document_id: Uuid, user_id: Uuid, name: &str) -> ServerMessage {
    send(
        ws,
        &ClientMessage::Join {
            document_id,
            user_id,
            display_name: name.to_string(),
        },
    )
    .await;
    recv(ws).await
}

fn submit(base_version: u64, components: Vec<ComponentDto>) -> ClientMessage {
    ClientMessage::Submit(SubmitDto {
        operation_id: Uuid::new_v4(),
        base_version,
        components,
    })
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let harness = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&harness.url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_join_handshake() {
    let harness = start_test_server().await;
    let doc = Uuid::new_v4();
    harness.content.create_document(doc, "hello world").await;

    let mut ws = connect(&harness.url).await;
    match join(&mut ws, doc, Uuid::new_v4(), "Alice").await {
        ServerMessage::JoinReply {
            content,
            version,
            participants,
        } => {
            assert_eq!(content, "hello world");
            assert_eq!(version, 0);
            assert_eq!(participants.len(), 1);
            assert_eq!(participants[0].display_name, "Alice");
        }
        other => panic!("Expected JoinReply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_missing_document() {
    let harness = start_test_server().await;
    let mut ws = connect(&harness.url).await;

    match join(&mut ws, Uuid::new_v4(), Uuid::new_v4(), "Alice").await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("Expected NotFound error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_submit_requires_join() {
    let harness = start_test_server().await;
    let mut ws = connect(&harness.url).await;

    send(&mut ws, &submit(0, vec![ComponentDto::insert("x")])).await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotJoined),
        other => panic!("Expected NotJoined error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_submit_commits_and_broadcasts() {
    let harness = start_test_server().await;
    let doc = Uuid::new_v4();
    harness.content.create_document(doc, "abcd").await;

    let mut alice = connect(&harness.url).await;
    join(&mut alice, doc, Uuid::new_v4(), "Alice").await;

    let mut bob = connect(&harness.url).await;
    let bob_user = Uuid::new_v4();
    join(&mut bob, doc, bob_user, "Bob").await;

    // Alice sees Bob join.
    match recv(&mut alice).await {
        ServerMessage::UserJoined(participant) => {
            assert_eq!(participant.user_id, bob_user);
        }
        other => panic!("Expected UserJoined, got {other:?}"),
    }

    // Bob appends at the end.
    send(
        &mut bob,
        &submit(0, vec![ComponentDto::retain(4), ComponentDto::insert("!")]),
    )
    .await;

    // Bob gets the committed ack.
    match recv(&mut bob).await {
        ServerMessage::Committed(committed) => {
            assert_eq!(committed.base_version, 0);
            assert_eq!(committed.user_id, bob_user);
        }
        other => panic!("Expected Committed ack, got {other:?}"),
    }

    // Alice receives the broadcast of Bob's operation.
    match recv(&mut alice).await {
        ServerMessage::Committed(committed) => {
            assert_eq!(committed.base_version, 0);
            assert_eq!(committed.user_id, bob_user);
        }
        other => panic!("Expected Committed broadcast, got {other:?}"),
    }

    // The content store reflects the mutation.
    let snapshot = harness.content.snapshot(doc).await.unwrap();
    assert_eq!(snapshot.content, "abcd!");
    assert_eq!(snapshot.version, 1);
}

#[tokio::test]
async fn test_stale_submit_rebased_end_to_end() {
    let harness = start_test_server().await;
    let doc = Uuid::new_v4();
    harness.content.create_document(doc, "abcd").await;

    let mut alice = connect(&harness.url).await;
    join(&mut alice, doc, Uuid::new_v4(), "Alice").await;

    let mut bob = connect(&harness.url).await;
    join(&mut bob, doc, Uuid::new_v4(), "Bob").await;
    match recv(&mut alice).await {
        ServerMessage::UserJoined(_) => {}
        other => panic!("Expected UserJoined, got {other:?}"),
    }

    // Alice commits first.
    send(
        &mut alice,
        &submit(0, vec![ComponentDto::retain(4), ComponentDto::insert("!")]),
    )
    .await;
    match recv(&mut alice).await {
        ServerMessage::Committed(committed) => assert_eq!(committed.base_version, 0),
        other => panic!("Expected Committed, got {other:?}"),
    }

    // Bob still thinks the document is at version 0; his submit must be
    // rebased onto Alice's commit.
    send(
        &mut bob,
        &submit(0, vec![ComponentDto::insert("X"), ComponentDto::retain(4)]),
    )
    .await;

    // Bob's inbox: Alice's broadcast (base 0) and his own rebased ack
    // (base 1), in either order relative to his send.
    let mut saw_rebased_ack = false;
    for _ in 0..2 {
        if let ServerMessage::Committed(committed) = recv(&mut bob).await {
            if committed.base_version == 1 {
                saw_rebased_ack = true;
            }
        }
    }
    assert!(saw_rebased_ack, "Bob's submission should commit at version 1");

    let snapshot = harness.content.snapshot(doc).await.unwrap();
    assert_eq!(snapshot.content, "Xabcd!");
    assert_eq!(snapshot.version, 2);
}

#[tokio::test]
async fn test_sync_request_snapshot_over_threshold() {
    let harness = start_test_server().await;
    let doc = Uuid::new_v4();
    harness.content.create_document(doc, "").await;

    let mut alice = connect(&harness.url).await;
    join(&mut alice, doc, Uuid::new_v4(), "Alice").await;

    // Testing threshold is 10; commit 12 operations.
    for v in 0..12u64 {
        send(&mut alice, &submit(v, vec![ComponentDto::insert("a")])).await;
        match recv(&mut alice).await {
            ServerMessage::Committed(_) => {}
            other => panic!("Expected Committed, got {other:?}"),
        }
    }

    // A client at version 0 is too far behind: snapshot, not 12 messages.
    send(&mut alice, &ClientMessage::SyncRequest { client_version: 0 }).await;
    match recv(&mut alice).await {
        ServerMessage::SyncSnapshot { content, version } => {
            assert_eq!(content, "aaaaaaaaaaaa");
            assert_eq!(version, 12);
        }
        other => panic!("Expected SyncSnapshot, got {other:?}"),
    }

    // A nearly caught-up client gets the incremental replay.
    send(&mut alice, &ClientMessage::SyncRequest { client_version: 10 }).await;
    match recv(&mut alice).await {
        ServerMessage::SyncOperations { operations } => {
            assert_eq!(operations.len(), 2);
            assert_eq!(operations[0].base_version, 10);
            assert_eq!(operations[1].base_version, 11);
        }
        other => panic!("Expected SyncOperations, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cursor_relay() {
    let harness = start_test_server().await;
    let doc = Uuid::new_v4();
    harness.content.create_document(doc, "text").await;

    let mut alice = connect(&harness.url).await;
    join(&mut alice, doc, Uuid::new_v4(), "Alice").await;

    let mut bob = connect(&harness.url).await;
    let bob_user = Uuid::new_v4();
    join(&mut bob, doc, bob_user, "Bob").await;
    match recv(&mut alice).await {
        ServerMessage::UserJoined(_) => {}
        other => panic!("Expected UserJoined, got {other:?}"),
    }

    send(
        &mut bob,
        &ClientMessage::Cursor(CursorPositionDto {
            position: 3,
            has_selection: true,
            selection_start: Some(1),
            selection_end: Some(3),
        }),
    )
    .await;

    match recv(&mut alice).await {
        ServerMessage::CursorChanged { user_id, cursor } => {
            assert_eq!(user_id, bob_user);
            assert_eq!(cursor.position, 3);
            assert!(cursor.has_selection);
            assert_eq!(cursor.selection_start, Some(1));
            assert_eq!(cursor.selection_end, Some(3));
        }
        other => panic!("Expected CursorChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn test_leave_broadcasts_user_left() {
    let harness = start_test_server().await;
    let doc = Uuid::new_v4();
    harness.content.create_document(doc, "").await;

    let mut alice = connect(&harness.url).await;
    join(&mut alice, doc, Uuid::new_v4(), "Alice").await;

    let mut bob = connect(&harness.url).await;
    let bob_user = Uuid::new_v4();
    join(&mut bob, doc, bob_user, "Bob").await;
    match recv(&mut alice).await {
        ServerMessage::UserJoined(_) => {}
        other => panic!("Expected UserJoined, got {other:?}"),
    }

    send(&mut bob, &ClientMessage::Leave).await;

    match recv(&mut alice).await {
        ServerMessage::UserLeft { user_id } => assert_eq!(user_id, bob_user),
        other => panic!("Expected UserLeft, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_broadcasts_user_left() {
    let harness = start_test_server().await;
    let doc = Uuid::new_v4();
    harness.content.create_document(doc, "").await;

    let mut alice = connect(&harness.url).await;
    join(&mut alice, doc, Uuid::new_v4(), "Alice").await;

    let mut bob = connect(&harness.url).await;
    let bob_user = Uuid::new_v4();
    join(&mut bob, doc, bob_user, "Bob").await;
    match recv(&mut alice).await {
        ServerMessage::UserJoined(_) => {}
        other => panic!("Expected UserJoined, got {other:?}"),
    }

    // Abrupt close, no Leave message.
    drop(bob);

    match recv(&mut alice).await {
        ServerMessage::UserLeft { user_id } => assert_eq!(user_id, bob_user),
        other => panic!("Expected UserLeft, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let harness = start_test_server().await;
    let mut ws = connect(&harness.url).await;

    send(&mut ws, &ClientMessage::Ping).await;
    match recv(&mut ws).await {
        ServerMessage::Pong => {}
        other => panic!("Expected Pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_validation_error_end_to_end() {
    let harness = start_test_server().await;
    let doc = Uuid::new_v4();
    harness.content.create_document(doc, "abcd").await;

    let mut ws = connect(&harness.url).await;
    join(&mut ws, doc, Uuid::new_v4(), "Alice").await;

    send(&mut ws, &submit(0, vec![ComponentDto::delete(-2)])).await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Validation),
        other => panic!("Expected Validation error, got {other:?}"),
    }

    // The document is untouched.
    assert_eq!(harness.content.snapshot(doc).await.unwrap().content, "abcd");
}
