//! WebSocket connection state machine.
//!
//! Handles the read/write loop for a single WebSocket connection,
//! dispatching incoming commands and forwarding filtered applied changes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;

use super::messages::{WsCommand, WsMessage, WsMessageType};
use super::subscription::SubscriptionManager;
use crate::domain::{AppliedChange, Collection};
use crate::service::SnapshotStore;

/// Runs the read/write loop for a single WebSocket connection.
///
/// - Reads commands from the client and answers them.
/// - Forwards matching [`AppliedChange`]s from `change_rx` to the client.
pub async fn run_connection(
    socket: WebSocket,
    mut change_rx: broadcast::Receiver<AppliedChange>,
    store: Arc<SnapshotStore>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subs = SubscriptionManager::new();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_text_message(&text, &mut subs, &store);
                        if let Some(reply) = reply
                            && ws_tx.send(Message::text(reply)).await.is_err() {
                                break;
                            }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
            change = change_rx.recv() => {
                match change {
                    Ok(change) => {
                        if subs.matches(change.collection) {
                            let payload = serde_json::to_value(&change).unwrap_or_default();
                            let msg = WsMessage::new(
                                uuid::Uuid::new_v4().to_string(),
                                WsMessageType::Event,
                                payload,
                            );
                            let json = serde_json::to_string(&msg).unwrap_or_default();
                            if ws_tx.send(Message::text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "ws client lagged behind applied changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    tracing::debug!("ws connection closed");
}

/// Splits requested names into known collections, the wildcard flag, and
/// names that match nothing.
fn parse_collections(names: &[String]) -> (Vec<Collection>, bool, Vec<String>) {
    let mut collections = Vec::new();
    let mut wildcard = false;
    let mut unknown = Vec::new();
    for name in names {
        if name == "*" {
            wildcard = true;
        } else if let Ok(collection) = name.parse::<Collection>() {
            collections.push(collection);
        } else {
            unknown.push(name.clone());
        }
    }
    (collections, wildcard, unknown)
}

/// Handles a text message from the client, returning an optional JSON reply.
fn handle_text_message(
    text: &str,
    subs: &mut SubscriptionManager,
    store: &SnapshotStore,
) -> Option<String> {
    let Ok(msg) = serde_json::from_str::<WsMessage>(text) else {
        return serde_json::to_string(&WsMessage::error("", 400, "malformed JSON")).ok();
    };
    if msg.msg_type != WsMessageType::Command {
        return serde_json::to_string(&WsMessage::error(msg.id, 400, "expected a command")).ok();
    }
    let Ok(command) = serde_json::from_value::<WsCommand>(msg.payload) else {
        return serde_json::to_string(&WsMessage::error(msg.id, 404, "unknown command")).ok();
    };

    let reply = match command {
        WsCommand::Subscribe { collections } => {
            let (collections, wildcard, unknown) = parse_collections(&collections);
            subs.subscribe(&collections, wildcard);
            WsMessage::new(
                msg.id,
                WsMessageType::Response,
                json!({
                    "subscribed": collections,
                    "ignored": unknown,
                    "count": subs.count(),
                    "wildcard": subs.is_subscribed_all(),
                }),
            )
        }
        WsCommand::Unsubscribe { collections } => {
            let (collections, wildcard, unknown) = parse_collections(&collections);
            subs.unsubscribe(&collections, wildcard);
            WsMessage::new(
                msg.id,
                WsMessageType::Response,
                json!({
                    "unsubscribed": collections,
                    "ignored": unknown,
                    "remaining_count": subs.count(),
                }),
            )
        }
        WsCommand::GetCollection { collection } => {
            let Ok(parsed) = collection.parse::<Collection>() else {
                let message = format!("unknown collection: {collection}");
                return serde_json::to_string(&WsMessage::error(msg.id, 404, &message)).ok();
            };
            if !store.is_loaded() {
                return serde_json::to_string(&WsMessage::error(msg.id, 503, "snapshot not loaded"))
                    .ok();
            }
            match store.snapshot().collection_json(parsed) {
                Ok(rows) => WsMessage::new(
                    msg.id,
                    WsMessageType::Response,
                    json!({ "collection": parsed, "rows": rows }),
                ),
                Err(e) => WsMessage::error(msg.id, 500, &e.to_string()),
            }
        }
    };
    serde_json::to_string(&reply).ok()
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::gateway::{DataGateway, MemoryBackend};
    use crate::service::StoreOptions;
    use serde_json::Value;

    fn reply(text: &str, subs: &mut SubscriptionManager, store: &SnapshotStore) -> Value {
        let Some(reply) = handle_text_message(text, subs, store) else {
            panic!("expected a reply");
        };
        let Ok(value) = serde_json::from_str(&reply) else {
            panic!("reply should be JSON");
        };
        value
    }

    fn store() -> Arc<SnapshotStore> {
        let backend: Arc<dyn DataGateway> = Arc::new(MemoryBackend::new());
        Arc::new(SnapshotStore::new(backend, StoreOptions::default()))
    }

    #[test]
    fn malformed_json_is_an_error() {
        let store = store();
        let mut subs = SubscriptionManager::new();
        let value = reply("not json", &mut subs, &store);
        assert_eq!(value.get("type"), Some(&json!("error")));
    }

    #[test]
    fn subscribe_reports_ignored_names() {
        let store = store();
        let mut subs = SubscriptionManager::new();
        let value = reply(
            r#"{"id":"1","type":"command","payload":{"command":"subscribe","collections":["players","fixtures"]}}"#,
            &mut subs,
            &store,
        );
        assert_eq!(value.get("type"), Some(&json!("response")));
        assert_eq!(value.pointer("/payload/subscribed"), Some(&json!(["players"])));
        assert_eq!(value.pointer("/payload/ignored"), Some(&json!(["fixtures"])));
        assert!(subs.matches(Collection::Players));
    }

    #[test]
    fn get_collection_before_load_is_unavailable() {
        let store = store();
        let mut subs = SubscriptionManager::new();
        let value = reply(
            r#"{"id":"2","type":"command","payload":{"command":"get_collection","collection":"teams"}}"#,
            &mut subs,
            &store,
        );
        assert_eq!(value.pointer("/payload/code"), Some(&json!(503)));
    }

    #[tokio::test]
    async fn get_collection_after_load_returns_rows() {
        let store = store();
        let Ok(()) = store.start().await else {
            panic!("load should succeed");
        };
        let mut subs = SubscriptionManager::new();
        let value = reply(
            r#"{"id":"3","type":"command","payload":{"command":"get_collection","collection":"site_settings"}}"#,
            &mut subs,
            &store,
        );
        assert_eq!(value.pointer("/payload/collection"), Some(&json!("site_settings")));
        assert_eq!(
            value.pointer("/payload/rows/registration_open"),
            Some(&json!(false))
        );
    }
}
