//! Shared helpers for loopback integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use iotkit_rs::server::{BroadcastServer, ServerConfig, ServerHandler};
use iotkit_rs::Record;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a test waits for something that should happen
pub const WAIT: Duration = Duration::from_secs(5);

/// How long a test waits to be sure something does not happen
pub const QUIET: Duration = Duration::from_millis(300);

pub fn loopback() -> ServerConfig {
    ServerConfig::with_addr("127.0.0.1:0".parse().unwrap())
}

pub fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}", addr)
}

/// Address nothing is listening on
pub fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub async fn connect_client(addr: SocketAddr) -> WsClient {
    let (stream, _) = connect_async(ws_url(addr)).await.unwrap();
    stream
}

pub async fn send_record(client: &mut WsClient, record: &Record) {
    client
        .send(Message::Text(record.to_json().unwrap()))
        .await
        .unwrap();
}

/// Next text frame as JSON, or None if the stream closed
pub async fn next_json(client: &mut WsClient) -> Option<Value> {
    loop {
        match tokio::time::timeout(WAIT, client.next()).await.ok()?? {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// True if no text frame arrives within [`QUIET`]
pub async fn stays_quiet(client: &mut WsClient) -> bool {
    loop {
        match tokio::time::timeout(QUIET, client.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(Message::Text(_)))) => return false,
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

/// True once the stream has been closed by the server
pub async fn closed_by_server(client: &mut WsClient) -> bool {
    loop {
        match tokio::time::timeout(WAIT, client.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

pub async fn wait_for_clients<H: ServerHandler>(server: &BroadcastServer<H>, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while server.client_count().await != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {} clients, have {}",
            count,
            server.client_count().await
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `check` until it holds or [`WAIT`] elapses
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iotkit_rs=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
