//! Client entry types
//!
//! One [`ClientHandle`] per accepted WebSocket connection. The handle does not
//! own the socket; it feeds the connection's writer task through a bounded
//! queue and can ask the connection to close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::error::RegistryError;

/// Server-assigned connection identifier (monotonic, never reused)
pub type ConnectionId = u64;

/// Registry-side handle for one connected client
#[derive(Debug)]
pub struct ClientHandle {
    /// Connection identifier
    pub id: ConnectionId,

    /// Remote address
    pub peer_addr: SocketAddr,

    /// Wall-clock accept time
    pub connected_at: DateTime<Utc>,

    /// Monotonic accept time
    pub(crate) accepted: Instant,

    tx: mpsc::Sender<Bytes>,
    closed: watch::Sender<bool>,
    messages_sent: AtomicU64,
}

impl ClientHandle {
    /// Create a handle and the queue receiver its writer task will drain
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, queue_capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (closed, _) = watch::channel(false);

        let handle = Self {
            id,
            peer_addr,
            connected_at: Utc::now(),
            accepted: Instant::now(),
            tx,
            closed,
            messages_sent: AtomicU64::new(0),
        };

        (handle, rx)
    }

    /// Queue a payload without waiting.
    ///
    /// Fails when the queue is full (slow client) or the writer is gone.
    pub fn try_deliver(&self, payload: Bytes) -> Result<(), RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::Closed(self.id));
        }

        match self.tx.try_send(payload) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(RegistryError::QueueFull(self.id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RegistryError::Closed(self.id)),
        }
    }

    /// Ask the connection to close. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Check if close was requested
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver resolving once close is requested
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Messages queued for this client so far
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Snapshot for status reporting
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            peer_addr: self.peer_addr,
            connected_at: self.connected_at,
            connected_secs: self.accepted.elapsed().as_secs(),
            messages_sent: self.messages_sent(),
        }
    }
}

/// Point-in-time description of a connected client
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub connected_secs: u64,
    pub messages_sent: u64,
}
