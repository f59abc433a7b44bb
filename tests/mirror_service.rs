//! End-to-end tests of the HTTP and WebSocket surface over the in-memory
//! backend.

#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::Message;

use cnfl_sync::api;
use cnfl_sync::app_state::AppState;
use cnfl_sync::domain::{Collection, Player};
use cnfl_sync::gateway::{DataGateway, MemoryBackend};
use cnfl_sync::error::StoreError;
use cnfl_sync::service::{LoadState, SnapshotStore, StoreOptions};

struct Harness {
    addr: SocketAddr,
    store: Arc<SnapshotStore>,
}

async fn spawn_app(start: bool) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .seed(
            Collection::Players,
            vec![
                json!({ "name": "Kohli", "points": [40, 12] }),
                json!({ "name": "Bumrah", "points": [3] }),
            ],
        )
        .await;
    let gateway: Arc<dyn DataGateway> = backend;
    let store = Arc::new(SnapshotStore::new(gateway, StoreOptions::default()));
    if start {
        assert_ok!(store.start().await);
    }

    let app = api::build_app(AppState::new(Arc::clone(&store)));
    let listener = assert_ok!(tokio::net::TcpListener::bind("127.0.0.1:0").await);
    let addr = assert_ok!(listener.local_addr());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Harness { addr, store }
}

async fn get_json(url: String) -> (u16, Value) {
    let response = assert_ok!(reqwest::get(url).await);
    let status = response.status().as_u16();
    let body: Value = assert_ok!(response.json().await);
    (status, body)
}

#[tokio::test]
async fn health_reports_load_state() {
    let harness = spawn_app(true).await;
    let (status, body) = get_json(format!("http://{}/health", harness.addr)).await;
    assert_eq!(status, 200);
    assert_eq!(body.get("status"), Some(&json!("healthy")));
    assert_eq!(body.get("load_state"), Some(&json!("loaded")));
}

#[tokio::test]
async fn collection_endpoint_serves_loaded_rows() {
    let harness = spawn_app(true).await;
    let (status, body) =
        get_json(format!("http://{}/api/v1/collections/players", harness.addr)).await;
    assert_eq!(status, 200);
    let Some(rows) = body.as_array() else {
        panic!("expected an array, got {body}");
    };
    assert_eq!(rows.len(), 2);

    let (status, body) = get_json(format!("http://{}/api/v1/collections", harness.addr)).await;
    assert_eq!(status, 200);
    let players = body
        .as_array()
        .and_then(|list| list.iter().find(|c| c.get("collection") == Some(&json!("players"))));
    assert_eq!(players.and_then(|p| p.get("rows")), Some(&json!(2)));
}

#[tokio::test]
async fn unknown_collection_is_not_found() {
    let harness = spawn_app(true).await;
    let (status, body) =
        get_json(format!("http://{}/api/v1/collections/fixtures", harness.addr)).await;
    assert_eq!(status, 404);
    assert_eq!(body.pointer("/error/code"), Some(&json!(2001)));
}

#[tokio::test]
async fn snapshot_is_unavailable_before_load() {
    let harness = spawn_app(false).await;
    let (status, body) = get_json(format!("http://{}/api/v1/snapshot", harness.addr)).await;
    assert_eq!(status, 503);
    assert_eq!(body.pointer("/error/code"), Some(&json!(3001)));

    let (_, health) = get_json(format!("http://{}/health", harness.addr)).await;
    assert_eq!(health.get("load_state"), Some(&json!("not_loaded")));
}

#[tokio::test]
async fn openapi_document_is_served() {
    let harness = spawn_app(false).await;
    let (status, body) = get_json(format!("http://{}/api-docs/openapi.json", harness.addr)).await;
    assert_eq!(status, 200);
    assert!(body.pointer("/paths/~1api~1v1~1snapshot").is_some());
}

#[tokio::test]
async fn websocket_subscriber_sees_inserted_player() {
    let harness = spawn_app(true).await;
    let (mut socket, _) = assert_ok!(
        tokio_tungstenite::connect_async(format!("ws://{}/ws", harness.addr)).await
    );

    let subscribe = json!({
        "id": "sub-1",
        "type": "command",
        "payload": { "command": "subscribe", "collections": ["players"] }
    });
    assert_ok!(socket.send(Message::text(subscribe.to_string())).await);
    let reply = next_json(&mut socket).await;
    assert_eq!(reply.get("id"), Some(&json!("sub-1")));
    assert_eq!(reply.pointer("/payload/subscribed"), Some(&json!(["players"])));

    let player = Player {
        name: "Jadeja".to_string(),
        points: vec![25],
        ..Player::default()
    };
    let Some(created) = harness.store.create(&player).await else {
        panic!("insert should succeed");
    };

    let event = next_json(&mut socket).await;
    assert_eq!(event.get("type"), Some(&json!("event")));
    assert_eq!(event.pointer("/payload/collection"), Some(&json!("players")));
    assert_eq!(event.pointer("/payload/kind"), Some(&json!("INSERT")));
    assert_eq!(
        event.pointer("/payload/id"),
        Some(&json!(created.id.as_str()))
    );
    assert_eq!(harness.store.snapshot().players.len(), 3);
}

#[tokio::test]
async fn shutdown_lets_background_load_finish() {
    let backend = Arc::new(MemoryBackend::new());
    backend.hold_reads();
    let gateway: Arc<dyn DataGateway> = Arc::clone(&backend) as Arc<dyn DataGateway>;
    let store = Arc::new(SnapshotStore::new(gateway, StoreOptions::default()));

    let loader = store.start_in_background();
    let mut state = store.subscribe_load_state();
    let loading = matches!(
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == LoadState::Loading),
        )
        .await,
        Ok(Ok(_))
    );
    assert!(loading, "load never started");

    store.shutdown().await;
    backend.release_reads();
    let Ok(Ok(finished)) = tokio::time::timeout(Duration::from_secs(5), loader).await else {
        panic!("loader did not finish");
    };
    assert!(matches!(finished, Err(StoreError::Closed)));
    assert_eq!(
        store.load_state(),
        LoadState::Failed(StoreError::Closed.to_string())
    );
    let released = tokio::time::timeout(Duration::from_secs(5), async {
        while backend.subscriber_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "change subscription outlived shutdown");
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), socket.next()).await;
        let Ok(Some(Ok(message))) = next else {
            panic!("no message from server");
        };
        if let Message::Text(text) = message {
            return assert_ok!(serde_json::from_str(text.as_str()));
        }
    }
}
