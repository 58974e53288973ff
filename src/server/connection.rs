//! Per-client connection task
//!
//! Each accepted socket runs through:
//! 1. WebSocket handshake (bounded by `handshake_timeout`)
//! 2. Registration, then `on_connect`
//! 3. A writer task draining the client's queue, plus the reader loop here
//! 4. Unregistration and `on_disconnect`

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::client::handler::{panic_message, run_guarded};
use crate::client::transport::stop_requested;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::registry::{ClientHandle, ClientRegistry, ConnectionId};
use crate::server::config::ServerConfig;
use crate::server::handler::{ClientContext, ServerHandler};
use crate::stats::ServerCounters;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// One accepted client
pub(crate) struct Connection<H: ServerHandler> {
    id: ConnectionId,
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: ServerConfig,
    handler: Arc<H>,
    registry: Arc<ClientRegistry>,
    counters: Arc<ServerCounters>,
}

impl<H: ServerHandler> Connection<H> {
    pub(crate) fn new(
        id: ConnectionId,
        socket: TcpStream,
        peer_addr: SocketAddr,
        config: ServerConfig,
        handler: Arc<H>,
        registry: Arc<ClientRegistry>,
        counters: Arc<ServerCounters>,
    ) -> Self {
        Self {
            id,
            socket,
            peer_addr,
            config,
            handler,
            registry,
            counters,
        }
    }

    /// Drive the connection to completion
    pub(crate) async fn run(self) -> Result<()> {
        let Connection {
            id,
            socket,
            peer_addr,
            config,
            handler,
            registry,
            counters,
        } = self;

        let endpoint = peer_addr.to_string();
        let mut ws = match tokio::time::timeout(config.handshake_timeout, accept_async(socket)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                counters.connection_rejected();
                return Err(Error::connection(endpoint, e));
            }
            Err(_) => {
                counters.connection_rejected();
                return Err(Error::connection(
                    endpoint,
                    Error::timeout("handshake", config.handshake_timeout),
                ));
            }
        };

        let (handle, queue) = ClientHandle::new(id, peer_addr, config.client_queue_capacity);
        let handle = Arc::new(handle);
        let ctx = ClientContext {
            connection_id: id,
            peer_addr,
            connected_at: handle.connected_at,
        };

        if let Err(e) = registry.register(Arc::clone(&handle)).await {
            counters.connection_rejected();
            tracing::debug!(connection_id = id, peer = %peer_addr, error = %e, "Client not registered");
            close_quietly(&mut ws, config.send_timeout).await;
            return Ok(());
        }

        let accepted = match AssertUnwindSafe(handler.on_connect(&ctx)).catch_unwind().await {
            Ok(accepted) => accepted,
            Err(panic) => {
                tracing::warn!(
                    connection_id = id,
                    error = %panic_message(&*panic),
                    "on_connect panicked, rejecting client"
                );
                false
            }
        };

        if !accepted {
            registry.unregister(id).await;
            handle.close();
            counters.connection_rejected();
            tracing::info!(connection_id = id, peer = %peer_addr, "Client rejected by handler");
            close_quietly(&mut ws, config.send_timeout).await;
            return Ok(());
        }

        counters.connection_opened();
        tracing::info!(connection_id = id, peer = %peer_addr, "Client connected");

        let (sink, source) = ws.split();
        let writer = tokio::spawn(write_loop(sink, queue, Arc::clone(&handle), config.send_timeout));

        read_loop(source, &handle, &ctx, handler.as_ref(), &counters).await;

        registry.unregister(id).await;
        handle.close();
        if let Err(e) = writer.await {
            tracing::warn!(connection_id = id, error = %e, "Writer task failed");
        }
        counters.connection_closed();

        if let Err(reason) = run_guarded(async {
            handler.on_disconnect(&ctx).await;
            Ok(())
        })
        .await
        {
            tracing::warn!(connection_id = id, error = %reason, "on_disconnect failed");
        }

        tracing::info!(
            connection_id = id,
            peer = %peer_addr,
            messages_sent = handle.messages_sent(),
            "Client disconnected"
        );

        Ok(())
    }
}

async fn read_loop<H: ServerHandler>(
    mut source: WsSource,
    handle: &ClientHandle,
    ctx: &ClientContext,
    handler: &H,
    counters: &ServerCounters,
) {
    let mut closed = handle.closed_signal();

    loop {
        tokio::select! {
            _ = stop_requested(&mut closed) => break,
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch(text.as_bytes(), ctx, handler, counters).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    dispatch(&data, ctx, handler, counters).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong handled by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = ctx.connection_id, error = %e, "Read failed");
                    break;
                }
            },
        }
    }
}

async fn dispatch<H: ServerHandler>(
    payload: &[u8],
    ctx: &ClientContext,
    handler: &H,
    counters: &ServerCounters,
) {
    let record = match Record::from_slice(payload) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(
                connection_id = ctx.connection_id,
                peer = %ctx.peer_addr,
                error = %e,
                "Skipping malformed client message"
            );
            return;
        }
    };

    counters.message_received();
    tracing::debug!(connection_id = ctx.connection_id, "Record received from client");

    if let Err(reason) = run_guarded(handler.on_message(ctx, record)).await {
        tracing::warn!(
            connection_id = ctx.connection_id,
            peer = %ctx.peer_addr,
            error = %reason,
            "Server handler failed"
        );
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut queue: mpsc::Receiver<Bytes>,
    handle: Arc<ClientHandle>,
    send_timeout: Duration,
) {
    let mut closed: watch::Receiver<bool> = handle.closed_signal();

    loop {
        let payload = tokio::select! {
            biased;
            _ = stop_requested(&mut closed) => break,
            payload = queue.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        // The frame owns its text: one copy per client
        let text = match String::from_utf8(payload.to_vec()) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(connection_id = handle.id, error = %e, "Dropping non-UTF-8 payload");
                continue;
            }
        };

        match tokio::time::timeout(send_timeout, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id = handle.id, error = %e, "Write failed");
                handle.close();
                return;
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = handle.id,
                    timeout_ms = send_timeout.as_millis() as u64,
                    "Write timed out, closing client"
                );
                handle.close();
                return;
            }
        }
    }

    let _ = tokio::time::timeout(send_timeout, sink.send(Message::Close(None))).await;
}

async fn close_quietly(ws: &mut WebSocketStream<TcpStream>, limit: Duration) {
    let _ = tokio::time::timeout(limit, ws.close(None)).await;
}
