//! Bridge relaying between loopback WebSocket servers and clients

mod common;

use tokio::sync::mpsc;

use iotkit_rs::bridge::{relay_path, relayed_by, Bridge, RELAYED_BY_FIELD};
use iotkit_rs::client::{HandlerResult, WsConfig};
use iotkit_rs::server::{BroadcastServer, ClientContext, NullHandler, ServerHandler};
use iotkit_rs::{ConnectionState, Record, ServerState};

use common::*;

struct Inbox(mpsc::UnboundedSender<Record>);

impl ServerHandler for Inbox {
    async fn on_message(&self, _ctx: &ClientContext, record: Record) -> HandlerResult {
        let _ = self.0.send(record);
        Ok(())
    }
}

fn ws(addr: std::net::SocketAddr) -> WsConfig {
    WsConfig::new(ws_url(addr)).no_reconnect()
}

#[tokio::test]
async fn test_subscriber_records_reach_each_client_once() {
    init_tracing();
    let upstream = BroadcastServer::new(loopback(), NullHandler);
    let upstream_addr = upstream.start().await.unwrap();

    let bridge = Bridge::with_id(loopback(), "bridge-a");
    let bridge_addr = bridge.start().await.unwrap();
    bridge.add_subscriber("upstream", ws(upstream_addr)).await.unwrap();
    wait_for_clients(&upstream, 1).await;

    let mut a = connect_client(bridge_addr).await;
    let mut b = connect_client(bridge_addr).await;
    wait_for_clients(bridge.server(), 2).await;

    upstream
        .broadcast(&Record::stamped().with("temperature", 19.5))
        .await
        .unwrap();

    for client in [&mut a, &mut b] {
        let envelope = next_json(client).await.unwrap();
        assert_eq!(envelope[RELAYED_BY_FIELD], "bridge-a");
        assert_eq!(envelope["source"], "websocket_subscriber");
        assert_eq!(envelope["subscriber_name"], "upstream");
        assert_eq!(envelope["data"]["temperature"], 19.5);
        assert!(envelope["timestamp"].is_string());
    }
    assert!(stays_quiet(&mut a).await);
    assert!(stays_quiet(&mut b).await);

    bridge.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn test_own_relayed_records_are_not_relayed_again() {
    let upstream = BroadcastServer::new(loopback(), NullHandler);
    let upstream_addr = upstream.start().await.unwrap();

    let bridge = Bridge::with_id(loopback(), "bridge-loop");
    let bridge_addr = bridge.start().await.unwrap();
    bridge.add_subscriber("upstream", ws(upstream_addr)).await.unwrap();
    wait_for_clients(&upstream, 1).await;

    let mut client = connect_client(bridge_addr).await;
    wait_for_clients(bridge.server(), 1).await;

    // Echo of something this bridge already relayed
    let echoed = Record::stamped()
        .with(RELAYED_BY_FIELD, "bridge-loop")
        .with("data", serde_json::json!({"temperature": 1}));
    upstream.broadcast(&echoed).await.unwrap();
    assert!(stays_quiet(&mut client).await);

    // Another bridge's tag is relayed normally
    let foreign = Record::stamped().with(RELAYED_BY_FIELD, "bridge-other");
    upstream.broadcast(&foreign).await.unwrap();
    let envelope = next_json(&mut client).await.unwrap();
    assert_eq!(envelope[RELAYED_BY_FIELD], "bridge-loop");
    assert_eq!(envelope["data"][RELAYED_BY_FIELD], "bridge-other");

    bridge.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn test_client_records_forwarded_to_publishers() {
    let (tx, mut downstream_inbox) = mpsc::unbounded_channel();
    let downstream = BroadcastServer::new(loopback(), Inbox(tx));
    let downstream_addr = downstream.start().await.unwrap();

    let bridge = Bridge::with_id(loopback(), "bridge-out");
    let bridge_addr = bridge.start().await.unwrap();
    bridge.add_publisher("downstream", ws(downstream_addr)).await.unwrap();

    let mut client = connect_client(bridge_addr).await;
    wait_for_clients(bridge.server(), 1).await;

    send_record(&mut client, &Record::stamped().with("door", "open")).await;

    let envelope = tokio::time::timeout(WAIT, downstream_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relayed_by(&envelope), Some("bridge-out"));
    assert_eq!(relay_path(&envelope), vec!["bridge-out"]);
    assert_eq!(envelope.get("source").unwrap(), "websocket_client");
    assert_eq!(envelope.get("data").unwrap()["door"], "open");
    assert!(envelope.contains("client_address"));

    // Already tagged by this bridge: dropped
    send_record(
        &mut client,
        &Record::stamped().with(RELAYED_BY_FIELD, "bridge-out"),
    )
    .await;
    let nothing = tokio::time::timeout(QUIET, downstream_inbox.recv()).await;
    assert!(nothing.is_err());

    bridge.stop().await;
    downstream.stop().await;
}

#[tokio::test]
async fn test_status_reports_failed_endpoints() {
    let bridge = Bridge::with_id(loopback(), "bridge-status");
    let addr = bridge.start().await.unwrap();

    assert!(bridge.add_publisher("dead", ws(closed_addr())).await.is_err());
    assert!(bridge.add_subscriber("dead-in", ws(closed_addr())).await.is_err());

    let status = bridge.get_status().await;
    assert_eq!(status.id, "bridge-status");
    assert_eq!(status.server_state, ServerState::Running);
    assert_eq!(status.server_addr, Some(addr));
    assert_eq!(status.server_clients, 0);
    assert_eq!(status.publishers["dead"].state, ConnectionState::Disconnected);
    assert_eq!(status.publishers["dead"].kind, "websocket");
    assert_eq!(status.subscribers["dead-in"].state, ConnectionState::Disconnected);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["publishers"]["dead"]["state"], "disconnected");

    assert!(bridge.remove_publisher("dead").await);
    assert!(!bridge.remove_publisher("dead").await);
    assert!(bridge.remove_subscriber("dead-in").await);
    assert!(bridge.publisher_names().await.is_empty());

    bridge.stop().await;
    assert_eq!(bridge.get_status().await.server_state, ServerState::Stopped);
}

#[tokio::test]
async fn test_replacing_an_endpoint_keeps_one_entry() {
    let upstream = BroadcastServer::new(loopback(), NullHandler);
    let upstream_addr = upstream.start().await.unwrap();

    let bridge = Bridge::with_id(loopback(), "bridge-replace");
    bridge.start().await.unwrap();

    bridge.add_subscriber("feed", ws(upstream_addr)).await.unwrap();
    wait_for_clients(&upstream, 1).await;
    bridge.add_subscriber("feed", ws(upstream_addr)).await.unwrap();

    assert_eq!(bridge.subscriber_names().await, vec!["feed"]);
    // Old connection closed, new one open
    wait_for_clients(&upstream, 1).await;
    assert_eq!(upstream.stats().total_connections, 2);

    // Same for publishers: one record out, one downstream connection
    let (tx, mut inbox) = mpsc::unbounded_channel();
    let downstream = BroadcastServer::new(loopback(), Inbox(tx));
    let downstream_addr = downstream.start().await.unwrap();
    bridge.add_publisher("out", ws(downstream_addr)).await.unwrap();
    bridge.add_publisher("out", ws(downstream_addr)).await.unwrap();
    wait_for_clients(&downstream, 1).await;
    assert_eq!(bridge.publisher_names().await, vec!["out"]);

    let mut client = connect_client(bridge.server().local_addr().unwrap()).await;
    wait_for_clients(bridge.server(), 1).await;
    send_record(&mut client, &Record::stamped().with("n", 1)).await;
    assert!(tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().is_some());
    assert!(tokio::time::timeout(QUIET, inbox.recv()).await.is_err());

    bridge.stop().await;
    wait_for_clients(&upstream, 0).await;
    wait_for_clients(&downstream, 0).await;
    upstream.stop().await;
    downstream.stop().await;
}

#[tokio::test]
async fn test_bridges_publishing_to_each_other_do_not_loop() {
    let a = Bridge::with_id(loopback(), "bridge-a");
    let b = Bridge::with_id(loopback(), "bridge-b");
    let a_addr = a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();

    a.add_publisher("to-b", ws(b_addr)).await.unwrap();
    b.add_publisher("to-a", ws(a_addr)).await.unwrap();
    wait_for_clients(a.server(), 1).await;
    wait_for_clients(b.server(), 1).await;

    let mut client = connect_client(a_addr).await;
    wait_for_clients(a.server(), 2).await;
    send_record(&mut client, &Record::stamped().with("door", "open")).await;

    // client -> a -> b -> a, where a recognises itself in the path
    let received = |bridge: &Bridge| bridge.server().stats().messages_received;
    assert!(eventually(|| received(&a) == 2 && received(&b) == 1).await);
    tokio::time::sleep(QUIET).await;
    assert_eq!(received(&a), 2);
    assert_eq!(received(&b), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_subscriber_callback_replaces_default_relay() {
    let upstream = BroadcastServer::new(loopback(), NullHandler);
    let upstream_addr = upstream.start().await.unwrap();

    let bridge = Bridge::with_id(loopback(), "bridge-callback");
    let bridge_addr = bridge.start().await.unwrap();

    let (tx, mut seen) = mpsc::unbounded_channel();
    bridge
        .add_subscriber_with_callback("upstream", ws(upstream_addr), move |_source: &str, record: Record| {
            let _ = tx.send(record);
            Ok(())
        })
        .await
        .unwrap();
    wait_for_clients(&upstream, 1).await;

    let mut client = connect_client(bridge_addr).await;
    wait_for_clients(bridge.server(), 1).await;

    upstream
        .broadcast(&Record::stamped().with("level", 3))
        .await
        .unwrap();
    let record = tokio::time::timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(record.get("level").unwrap(), 3);
    assert!(stays_quiet(&mut client).await);

    // Loop prevention still applies ahead of the callback
    upstream
        .broadcast(&Record::stamped().with(RELAYED_BY_FIELD, "bridge-callback"))
        .await
        .unwrap();
    assert!(tokio::time::timeout(QUIET, seen.recv()).await.is_err());

    bridge.stop().await;
    upstream.stop().await;
}
