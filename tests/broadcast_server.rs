//! Broadcast server over real loopback WebSocket connections

mod common;

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use iotkit_rs::client::HandlerResult;
use iotkit_rs::server::{BroadcastServer, ClientContext, NullHandler, ServerHandler};
use iotkit_rs::{Error, Record, ServerState};

use common::*;

#[derive(Debug)]
enum Event {
    Connected(u64),
    Message(u64, Record),
    Disconnected(u64),
}

struct RecordingHandler {
    events: mpsc::UnboundedSender<Event>,
    accept: AtomicBool,
}

impl RecordingHandler {
    fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                accept: AtomicBool::new(true),
            },
            rx,
        )
    }
}

impl ServerHandler for RecordingHandler {
    async fn on_connect(&self, ctx: &ClientContext) -> bool {
        let accept = self.accept.load(Ordering::SeqCst);
        if accept {
            let _ = self.events.send(Event::Connected(ctx.connection_id));
        }
        accept
    }

    async fn on_message(&self, ctx: &ClientContext, record: Record) -> HandlerResult {
        if record.contains("fail") {
            return Err("rejected by handler".into());
        }
        let _ = self.events.send(Event::Message(ctx.connection_id, record));
        Ok(())
    }

    async fn on_disconnect(&self, ctx: &ClientContext) {
        let _ = self.events.send(Event::Disconnected(ctx.connection_id));
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for handler event")
        .expect("handler channel closed")
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    init_tracing();
    let server = BroadcastServer::new(loopback(), NullHandler);
    let addr = server.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect_client(addr).await);
    }
    wait_for_clients(&server, 3).await;

    let record = Record::stamped().with("sensor", "boiler").with("temperature", 71.5);
    let report = server.broadcast(&record).await.unwrap();
    assert_eq!(report.sent, 3);
    assert_eq!(report.failed, 0);

    for client in &mut clients {
        let received = next_json(client).await.unwrap();
        assert_eq!(received["sensor"], "boiler");
        assert_eq!(received["temperature"], 71.5);
        assert_eq!(received["timestamp"], *record.timestamp().unwrap());
    }

    let stats = server.stats();
    assert_eq!(stats.broadcasts, 1);
    assert_eq!(stats.deliveries_sent, 3);

    server.stop().await;
}

#[tokio::test]
async fn test_registry_tracks_connects_and_disconnects() {
    let server = BroadcastServer::new(loopback(), NullHandler);
    let addr = server.start().await.unwrap();

    let first = connect_client(addr).await;
    let mut second = connect_client(addr).await;
    wait_for_clients(&server, 2).await;

    let infos = server.clients().await;
    assert_eq!(infos.len(), 2);
    assert!(infos[0].id < infos[1].id);

    drop(first);
    wait_for_clients(&server, 1).await;

    let report = server.broadcast(&Record::stamped().with("n", 1)).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(next_json(&mut second).await.unwrap()["n"], 1);

    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_clients_and_empties_registry() {
    let server = BroadcastServer::new(loopback(), NullHandler);
    let addr = server.start().await.unwrap();

    let mut a = connect_client(addr).await;
    let mut b = connect_client(addr).await;
    wait_for_clients(&server, 2).await;

    server.stop().await;

    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.client_count().await, 0);
    assert!(server.local_addr().is_none());
    assert!(closed_by_server(&mut a).await);
    assert!(closed_by_server(&mut b).await);

    let err = server.broadcast(&Record::stamped()).await.unwrap_err();
    assert!(matches!(err, Error::NotRunning));

    // Second stop is a no-op
    server.stop().await;
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let server = BroadcastServer::new(loopback(), NullHandler);
    server.start().await.unwrap();
    server.stop().await;

    let addr = server.start().await.unwrap();
    let _client = connect_client(addr).await;
    wait_for_clients(&server, 1).await;

    server.stop().await;
}

#[tokio::test]
async fn test_handler_callbacks_in_order() {
    let (handler, mut events) = RecordingHandler::new();
    let server = BroadcastServer::new(loopback(), handler);
    let addr = server.start().await.unwrap();

    let mut client = connect_client(addr).await;

    let id = match next_event(&mut events).await {
        Event::Connected(id) => id,
        other => panic!("expected connect, got {:?}", other),
    };

    // Malformed frames and handler errors do not end the connection
    {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;
        client.send(Message::Text("not json".into())).await.unwrap();
        client.send(Message::Text("[1, 2]".into())).await.unwrap();
    }
    send_record(&mut client, &Record::stamped().with("fail", true)).await;
    send_record(&mut client, &Record::stamped().with("humidity", 40)).await;

    match next_event(&mut events).await {
        Event::Message(from, record) => {
            assert_eq!(from, id);
            assert_eq!(record.get("humidity").unwrap(), 40);
        }
        other => panic!("expected message, got {:?}", other),
    }

    drop(client);

    match next_event(&mut events).await {
        Event::Disconnected(from) => assert_eq!(from, id),
        other => panic!("expected disconnect, got {:?}", other),
    }
    wait_for_clients(&server, 0).await;

    let stats = server.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_on_connect_can_refuse() {
    let (handler, mut events) = RecordingHandler::new();
    handler.accept.store(false, Ordering::SeqCst);
    let server = BroadcastServer::new(loopback(), handler);
    let addr = server.start().await.unwrap();

    let mut client = connect_client(addr).await;
    assert!(closed_by_server(&mut client).await);

    assert_eq!(server.client_count().await, 0);
    assert!(eventually(|| server.stats().rejected_connections == 1).await);
    assert!(events.try_recv().is_err());

    server.stop().await;
}

#[tokio::test]
async fn test_send_to_targets_one_client() {
    let server = BroadcastServer::new(loopback(), NullHandler);
    let addr = server.start().await.unwrap();

    let mut a = connect_client(addr).await;
    wait_for_clients(&server, 1).await;
    let mut b = connect_client(addr).await;
    wait_for_clients(&server, 2).await;

    let first_id = server.clients().await[0].id;
    server
        .send_to(first_id, &Record::stamped().with("direct", true))
        .await
        .unwrap();

    assert_eq!(next_json(&mut a).await.unwrap()["direct"], true);
    assert!(stays_quiet(&mut b).await);

    let err = server.send_to(9999, &Record::stamped()).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));

    server.stop().await;
}

#[tokio::test]
async fn test_connection_limit() {
    let server = BroadcastServer::new(loopback().max_connections(1), NullHandler);
    let addr = server.start().await.unwrap();

    let _first = connect_client(addr).await;
    wait_for_clients(&server, 1).await;

    // Over the limit: the socket is dropped before the handshake
    let second = tokio_tungstenite::connect_async(ws_url(addr)).await;
    assert!(second.is_err());
    assert_eq!(server.client_count().await, 1);
    assert_eq!(server.stats().rejected_connections, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_clones_share_state() {
    let server = BroadcastServer::new(loopback(), NullHandler);
    let handle = server.clone();
    let addr = server.start().await.unwrap();

    assert_eq!(handle.local_addr(), Some(addr));
    assert_eq!(handle.state(), ServerState::Running);

    let _client = connect_client(addr).await;
    wait_for_clients(&handle, 1).await;

    handle.stop().await;
    assert_eq!(server.state(), ServerState::Stopped);
}
