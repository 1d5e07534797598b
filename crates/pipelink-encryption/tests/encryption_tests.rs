//! End-to-end tests for encrypted connections.

use std::time::Duration;

use pipelink::{
    Formatter, PipeClient, PipeError, PipeEvent, PipeEvents, PipeServer,
    SingleConnectionPipeServer,
};
use pipelink_encryption::EnableEncryption;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

fn order(id: u32) -> Order {
    Order {
        id,
        item: format!("item-{}", id),
    }
}

async fn encrypted_pair(
    name: &str,
) -> (
    PipeServer<Order>,
    PipeEvents<Order>,
    PipeClient<Order>,
    PipeEvents<Order>,
) {
    let server: PipeServer<Order> = PipeServer::new(name);
    server.enable_encryption();
    let mut server_events = server.take_events().unwrap();
    server.start().await.unwrap();

    let client: PipeClient<Order> = PipeClient::new(name);
    client.enable_encryption();
    let mut client_events = client.take_events().unwrap();
    tokio::time::timeout(WAIT, client.connect())
        .await
        .expect("connect timed out")
        .expect("connect failed");

    server_events.wait_connected(WAIT).await.unwrap();
    client_events.wait_connected(WAIT).await.unwrap();
    (server, server_events, client, client_events)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_encrypted_roundtrip() {
    let name = unique_name("sealed");
    let (server, mut server_events, client, mut client_events) = encrypted_pair(&name).await;

    client.write(Some(&order(1))).await.unwrap();
    let (from, message) = server_events
        .wait_message(|_| true, WAIT)
        .await
        .unwrap();
    assert_eq!(message, Some(order(1)));

    server
        .write_to(from.pipe_name(), Some(&order(2)))
        .await
        .unwrap();
    let (_, message) = client_events
        .wait_message(|_| true, WAIT)
        .await
        .unwrap();
    assert_eq!(message, Some(order(2)));

    // The wire form is no longer plain JSON.
    let connection = client.connection().unwrap();
    let sealed = connection.formatter().serialize(Some(&order(3))).unwrap();
    assert!(serde_json::from_slice::<Order>(&sealed).is_err());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tampered_frame_reports_integrity_error() {
    let name = unique_name("tamper");
    let (server, mut server_events, client, _client_events) = encrypted_pair(&name).await;
    let connection = client.connection().unwrap();

    let mut sealed = connection.formatter().serialize(Some(&order(9))).unwrap();
    let middle = sealed.len() / 2;
    sealed[middle] ^= 0xff;
    connection.write_raw(&sealed).await.unwrap();

    let event = tokio::time::timeout(WAIT, server_events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        PipeEvent::Error { connection, error } => {
            assert!(connection.is_some());
            assert!(matches!(*error, PipeError::Integrity));
        }
        other => panic!("expected integrity error, got {:?}", other),
    }

    // The channel survives a bad frame.
    client.write(Some(&order(10))).await.unwrap();
    let (_, message) = server_events
        .wait_message(|_| true, WAIT)
        .await
        .unwrap();
    assert_eq!(message, Some(order(10)));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_frame_is_rejected_but_none_arrives() {
    let name = unique_name("empty-sealed");
    let (server, mut server_events, client, _client_events) = encrypted_pair(&name).await;
    let connection = client.connection().unwrap();

    connection.write_raw(&[]).await.unwrap();
    let event = tokio::time::timeout(WAIT, server_events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        PipeEvent::Error { error, .. } => assert!(matches!(*error, PipeError::Integrity)),
        other => panic!("expected integrity error, got {:?}", other),
    }

    client.write(None).await.unwrap();
    let event = tokio::time::timeout(WAIT, server_events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        PipeEvent::Message { message, .. } => assert_eq!(message, None),
        other => panic!("expected empty message, got {:?}", other),
    }

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_formatter_reverts_after_disconnect() {
    let name = unique_name("revert");
    let (server, _server_events, client, _client_events) = encrypted_pair(&name).await;
    let connection = client.connection().unwrap();

    client.disconnect().await;
    tokio::time::timeout(WAIT, connection.closed()).await.unwrap();

    let plain = connection.formatter().serialize(Some(&order(4))).unwrap();
    assert_eq!(serde_json::from_slice::<Order>(&plain).unwrap(), order(4));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plain_client_fails_key_exchange() {
    let name = unique_name("plain");
    let server: PipeServer<Order> = PipeServer::new(&name);
    server.enable_encryption_with_timeout(Duration::from_millis(300));
    let mut server_events = server.take_events().unwrap();
    server.start().await.unwrap();

    let client: PipeClient<Order> = PipeClient::new(&name);
    let mut client_events = client.take_events().unwrap();
    tokio::time::timeout(WAIT, client.connect())
        .await
        .unwrap()
        .unwrap();

    let event = tokio::time::timeout(WAIT, server_events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        PipeEvent::Error { error, .. } => {
            assert!(matches!(*error, PipeError::KeyExchange { .. }))
        }
        other => panic!("expected key exchange error, got {:?}", other),
    }
    assert!(server.connected_pipe_names().is_empty());

    // The server tore the data channel down.
    loop {
        let event = tokio::time::timeout(WAIT, client_events.recv())
            .await
            .unwrap()
            .unwrap();
        if let PipeEvent::Disconnected(_) = event {
            break;
        }
    }

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_connection_server_encryption() {
    let name = unique_name("single-sealed");
    let server: SingleConnectionPipeServer<Order> = SingleConnectionPipeServer::new(&name);
    server.enable_encryption();
    let mut server_events = server.take_events().unwrap();
    server.start().await.unwrap();

    let client: PipeClient<Order> = PipeClient::direct(&name);
    client.enable_encryption();
    tokio::time::timeout(WAIT, client.connect())
        .await
        .unwrap()
        .unwrap();
    server_events.wait_connected(WAIT).await.unwrap();

    client.write(Some(&order(5))).await.unwrap();
    let (_, message) = server_events
        .wait_message(|_| true, WAIT)
        .await
        .unwrap();
    assert_eq!(message, Some(order(5)));

    client.disconnect().await;
    server.stop().await;
}
