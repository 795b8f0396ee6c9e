// tests/integration_test.rs

//! End-to-end tests: a real server on a loopback socket, driven through the
//! thin producing client.

use logbus::client::ClientConnection;
use logbus::config::{AuthConfig, AuthUser, Config};
use logbus::core::LogBusError;
use logbus::core::auth::hash_password;
use logbus::core::protocol::{Document, FrameType};
use logbus::core::state::ServerState;
use logbus::server::{connection_loop, initialization};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().expect("expected a JSON object")
}

/// Boots a server on an ephemeral port and returns its address and state.
async fn start_server(mut config: Config) -> (SocketAddr, Arc<ServerState>) {
    config.port = 0;
    let ctx = initialization::setup(config).await.unwrap();
    let addr = ctx.listener.local_addr().unwrap();
    let state = ctx.state.clone();
    tokio::spawn(connection_loop::run(ctx));
    (addr, state)
}

#[tokio::test]
async fn producer_emits_events_into_the_channel_log() {
    let mut config = Config::default();
    config.channels = vec!["orders".into()];
    let (addr, state) = start_server(config).await;

    let conn = Arc::new(ClientConnection::connect(&addr.to_string()).await.unwrap());
    conn.authenticate("anyone", "anything").await.unwrap();

    let producer = conn.producer("orders");
    producer.emit(doc(json!({ "item": "widget" }))).await.unwrap();
    producer.emit(doc(json!({ "item": "gadget" }))).await.unwrap();

    let log = state.channels.get_log("orders").unwrap();
    assert_eq!(log.next_seq(), 2);
    conn.close();
}

#[tokio::test]
async fn emit_to_unknown_channel_surfaces_the_error() {
    let (addr, _state) = start_server(Config::default()).await;

    let conn = Arc::new(ClientConnection::connect(&addr.to_string()).await.unwrap());
    conn.authenticate("anyone", "anything").await.unwrap();

    let err = conn.emit("nope", Document::new()).await.unwrap_err();
    assert!(matches!(err, LogBusError::NoSuchChannel(_)));
    conn.close();
}

#[tokio::test]
async fn create_channel_then_emit_through_the_same_connection() {
    let (addr, state) = start_server(Config::default()).await;

    let conn = Arc::new(ClientConnection::connect(&addr.to_string()).await.unwrap());
    conn.authenticate("anyone", "anything").await.unwrap();

    let resp = conn
        .request(FrameType::CreateChannel, doc(json!({ "name": "orders" })))
        .await
        .unwrap();
    assert_eq!(resp.get("exists"), Some(&serde_json::Value::Bool(false)));

    conn.emit("orders", doc(json!({ "n": 1 }))).await.unwrap();
    assert_eq!(state.channels.get_log("orders").unwrap().next_seq(), 1);
    conn.close();
}

#[tokio::test]
async fn authentication_failure_is_reported_to_the_caller() {
    let mut config = Config::default();
    config.auth = AuthConfig {
        enabled: true,
        users: vec![AuthUser {
            username: "prod".into(),
            password_hash: hash_password("sekrit").unwrap(),
            permissions: vec!["*".into()],
        }],
    };
    let (addr, _state) = start_server(config).await;

    let conn = ClientConnection::connect(&addr.to_string()).await.unwrap();
    let err = conn.authenticate("prod", "wrong").await.unwrap_err();
    assert!(matches!(err, LogBusError::AuthenticationFailed));
    conn.close();
}

#[tokio::test]
async fn concurrent_producers_interleave_without_loss() {
    let mut config = Config::default();
    config.channels = vec!["orders".into()];
    let (addr, state) = start_server(config).await;

    let mut tasks = Vec::new();
    for producer_id in 0..4 {
        let addr = addr.to_string();
        tasks.push(tokio::spawn(async move {
            let conn = Arc::new(ClientConnection::connect(&addr).await.unwrap());
            conn.authenticate("anyone", "anything").await.unwrap();
            let producer = conn.producer("orders");
            for n in 0..25 {
                producer
                    .emit(doc(json!({ "producer": producer_id, "n": n })))
                    .await
                    .unwrap();
            }
            conn.close();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(state.channels.get_log("orders").unwrap().next_seq(), 100);
}
