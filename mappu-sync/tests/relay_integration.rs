//! Integration tests for the relay server.
//!
//! These tests start a real relay and connect real WebSocket clients,
//! verifying room membership, fan-out and eviction end to end.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use mappu_sync::awareness::AwarenessTable;
use mappu_sync::engine::{DocumentEngine, Origin, YrsEngine};
use mappu_sync::identity::{Identity, USER_FIELD};
use mappu_sync::protocol::RelayFrame;
use mappu_sync::provider::{Provider, ProviderContext, TransportStatus};
use mappu_sync::relay::{RelayClientConfig, RelayProvider, RelayServer, ServerConfig};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on a free port, return it with its URL.
async fn start_test_server(config: ServerConfig) -> (Arc<RelayServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(RelayServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    }));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, frame: &RelayFrame) {
    ws.send(Message::Text(frame.to_text().into())).await.unwrap();
}

/// Next text frame, or `None` if nothing arrives in time.
async fn recv(ws: &mut Ws, wait: Duration) -> Option<RelayFrame> {
    loop {
        match timeout(wait, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(RelayFrame::parse(text.as_str()).unwrap()),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

/// Join `room` and consume the join reply (snapshot, maybe awareness).
async fn join(url: &str, room: &str) -> Ws {
    let mut ws = connect(url).await;
    send(&mut ws, &RelayFrame::join(room)).await;
    let first = recv(&mut ws, Duration::from_secs(2)).await;
    assert!(matches!(first, Some(RelayFrame::Update { .. })), "join reply starts with a snapshot");
    ws
}

async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

// ─── Raw protocol ───────────────────────────────────────────────────

#[tokio::test]
async fn test_join_replies_with_snapshot() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let _ws = join(&url, "board-1").await;

    assert!(server.registry().contains("board-1").await);
    assert_eq!(server.registry().connection_count("board-1").await, 1);
}

#[tokio::test]
async fn test_update_relayed_without_echo() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let mut a = join(&url, "r").await;
    let mut b = join(&url, "r").await;

    let frame = RelayFrame::update(b"opaque");
    send(&mut a, &frame).await;

    assert_eq!(recv(&mut b, Duration::from_secs(2)).await, Some(frame));
    assert_eq!(recv(&mut a, Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_unjoined_connection_is_isolated() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let mut member = join(&url, "r").await;
    let mut stranger = connect(&url).await;

    send(&mut stranger, &RelayFrame::update(b"sneaky")).await;
    assert_eq!(recv(&mut member, Duration::from_millis(200)).await, None);

    // The stranger doesn't hear the room either.
    send(&mut member, &RelayFrame::update(b"private")).await;
    assert_eq!(recv(&mut stranger, Duration::from_millis(200)).await, None);
    assert!(server.stats().await.frames_dropped >= 1);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let mut a = join(&url, "r1").await;
    let mut b = join(&url, "r2").await;

    send(&mut a, &RelayFrame::update(b"r1 only")).await;
    assert_eq!(recv(&mut b, Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let mut ws = connect(&url).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"t":"x"}"#.into())).await.unwrap();
    send(&mut ws, &RelayFrame::join("r")).await;

    assert!(matches!(recv(&mut ws, Duration::from_secs(2)).await, Some(RelayFrame::Update { .. })));
    assert_eq!(server.stats().await.malformed_frames, 2);
}

#[tokio::test]
async fn test_join_moves_connection_between_rooms() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let mut ws = join(&url, "first").await;
    let mut other = join(&url, "first").await;

    send(&mut ws, &RelayFrame::join("second")).await;
    assert!(recv(&mut ws, Duration::from_secs(2)).await.is_some());
    assert_eq!(server.registry().connection_count("first").await, 1);
    assert_eq!(server.registry().connection_count("second").await, 1);

    send(&mut other, &RelayFrame::update(b"left behind")).await;
    assert_eq!(recv(&mut ws, Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_late_joiner_receives_awareness() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let mut a = join(&url, "r").await;

    let alice = AwarenessTable::new("alice");
    alice.set_local_field("name", serde_json::json!("Alice"));
    send(&mut a, &RelayFrame::awareness(&alice.encode_full().unwrap())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut b = connect(&url).await;
    send(&mut b, &RelayFrame::join("r")).await;
    assert!(matches!(recv(&mut b, Duration::from_secs(2)).await, Some(RelayFrame::Update { .. })));
    let aware = recv(&mut b, Duration::from_secs(2)).await.expect("awareness after snapshot");
    assert!(matches!(aware, RelayFrame::Awareness { .. }));

    let bob = AwarenessTable::new("bob");
    bob.apply_update(&aware.payload().unwrap(), Origin::Relay).unwrap();
    assert_eq!(bob.get("alice").unwrap()["name"], "Alice");
}

#[tokio::test]
async fn test_late_joiner_receives_document() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let mut a = join(&url, "r").await;

    let writer = YrsEngine::new();
    writer.transact_local(|txn| {
        let text = txn.get_or_insert_text("notes");
        text.insert(txn, 0, "hello");
    });
    send(&mut a, &RelayFrame::update(&writer.snapshot())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut b = connect(&url).await;
    send(&mut b, &RelayFrame::join("r")).await;
    let snapshot = recv(&mut b, Duration::from_secs(2)).await.unwrap();

    let reader = YrsEngine::new();
    assert!(reader.apply_update(&snapshot.payload().unwrap(), Origin::Relay).unwrap());
    let txn = reader.doc().transact();
    assert_eq!(txn.get_text("notes").unwrap().get_string(&txn), "hello");
}

#[tokio::test]
async fn test_empty_room_evicted_after_ttl() {
    let config = ServerConfig {
        room_ttl: Duration::from_millis(150),
        sweep_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let (server, url) = start_test_server(config).await;

    let mut ws = join(&url, "ephemeral").await;
    let _busy = join(&url, "busy").await;
    ws.close(None).await.unwrap();
    drop(ws);

    let registry = server.registry().clone();
    let evicted = timeout(Duration::from_secs(3), async {
        while registry.contains("ephemeral").await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(evicted.is_ok(), "empty room should be evicted");

    // A room with a member is never evicted.
    assert!(registry.contains("busy").await);
    assert!(server.stats().await.rooms_evicted >= 1);
}

// ─── Relay provider ─────────────────────────────────────────────────

fn provider_config(url: &str) -> RelayClientConfig {
    RelayClientConfig {
        url: url.to_string(),
        heartbeat_interval: Duration::from_millis(200),
        ..RelayClientConfig::default()
    }
}

#[tokio::test]
async fn test_relay_providers_converge() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (ea, eb) = (Arc::new(YrsEngine::new()), Arc::new(YrsEngine::new()));

    let alice = Identity::new("alicekey", "Alice");
    let pa = RelayProvider::connect(
        provider_config(&url),
        ProviderContext::new("board", ea.clone() as Arc<dyn DocumentEngine>, alice),
    )
    .unwrap();
    let pb = RelayProvider::connect(
        provider_config(&url),
        ProviderContext::new("board", eb.clone() as Arc<dyn DocumentEngine>, Identity::new("bobkey", "Bob")),
    )
    .unwrap();

    let (sa, sb) = (pa.status(), pb.status());
    assert!(wait_for(|| *sa.borrow() == TransportStatus::Online && *sb.borrow() == TransportStatus::Online).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    ea.transact_local(|txn| {
        let text = txn.get_or_insert_text("notes");
        text.insert(txn, 0, "pin at the harbour");
    });

    let read = |e: &YrsEngine| {
        let txn = e.doc().transact();
        txn.get_text("notes").map(|t| t.get_string(&txn)).unwrap_or_default()
    };
    assert!(wait_for(|| read(&eb) == "pin at the harbour").await);

    // Presence crosses too.
    let bob_view = pb.awareness();
    let alice_id = pa.awareness().local_id().to_string();
    assert!(wait_for(|| bob_view.get(&alice_id).is_some()).await);
    assert_eq!(bob_view.get(&alice_id).unwrap()[USER_FIELD]["name"], "Alice");

    // Destroy clears Alice from Bob's view.
    pa.destroy().await;
    assert!(wait_for(|| bob_view.get(&alice_id).is_none()).await);
    pb.destroy().await;
}
