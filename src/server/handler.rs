//! Server callbacks
//!
//! Implement [`ServerHandler`] to observe client connections on a
//! [`BroadcastServer`]. Only `on_message` is required.
//!
//! [`BroadcastServer`]: super::BroadcastServer

use std::future::Future;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use crate::client::handler::HandlerResult;
use crate::record::Record;
use crate::registry::ConnectionId;

/// Identity of the client a callback is about
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Server-assigned connection id
    pub connection_id: ConnectionId,
    /// Remote address
    pub peer_addr: SocketAddr,
    /// Wall-clock accept time
    pub connected_at: DateTime<Utc>,
}

/// Callbacks for broadcast server events
pub trait ServerHandler: Send + Sync + 'static {
    /// Called once the client has completed the handshake and been
    /// registered. Return false to drop it again.
    fn on_connect(&self, ctx: &ClientContext) -> impl Future<Output = bool> + Send {
        let _ = ctx;
        async { true }
    }

    /// Called for each record a client sends, in arrival order.
    ///
    /// Errors and panics are logged; the connection stays open.
    fn on_message(&self, ctx: &ClientContext, record: Record)
        -> impl Future<Output = HandlerResult> + Send;

    /// Called once after the client is removed from the registry
    fn on_disconnect(&self, ctx: &ClientContext) -> impl Future<Output = ()> + Send {
        let _ = ctx;
        async {}
    }
}

/// Handler that accepts every client and ignores inbound records
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl ServerHandler for NullHandler {
    async fn on_message(&self, ctx: &ClientContext, _record: Record) -> HandlerResult {
        tracing::trace!(connection_id = ctx.connection_id, "Ignoring inbound record");
        Ok(())
    }
}
