//! Client registry implementation
//!
//! The set of clients currently connected to a broadcast server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::RwLock;

use super::entry::{ClientHandle, ClientInfo, ConnectionId};
use super::error::RegistryError;

/// Outcome of a fan-out to every registered client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Clients the payload was queued for
    pub sent: usize,
    /// Clients that could not take it (and were removed)
    pub failed: usize,
}

impl BroadcastReport {
    /// Total clients attempted
    pub fn attempted(&self) -> usize {
        self.sent + self.failed
    }
}

struct Inner {
    clients: HashMap<ConnectionId, Arc<ClientHandle>>,
    accepting: bool,
}

/// Registry of connected clients
///
/// Thread-safe via `RwLock`. The lock covers the map only; fan-out takes a
/// snapshot of the handles and releases the lock before queueing anything.
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

impl ClientRegistry {
    /// Create an empty registry that accepts clients
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                clients: HashMap::new(),
                accepting: true,
            }),
        }
    }

    /// Add a client
    ///
    /// Fails on a duplicate id or once the registry has been drained.
    pub async fn register(&self, handle: Arc<ClientHandle>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;

        if !inner.accepting {
            return Err(RegistryError::NotAccepting);
        }
        if inner.clients.contains_key(&handle.id) {
            return Err(RegistryError::DuplicateConnection(handle.id));
        }

        tracing::debug!(
            connection_id = handle.id,
            peer = %handle.peer_addr,
            clients = inner.clients.len() + 1,
            "Client registered"
        );
        inner.clients.insert(handle.id, handle);

        Ok(())
    }

    /// Remove a client, returning its handle if it was present
    pub async fn unregister(&self, id: ConnectionId) -> Option<Arc<ClientHandle>> {
        let mut inner = self.inner.write().await;
        let removed = inner.clients.remove(&id);

        if let Some(ref handle) = removed {
            tracing::debug!(
                connection_id = id,
                peer = %handle.peer_addr,
                clients = inner.clients.len(),
                "Client unregistered"
            );
        }

        removed
    }

    /// Look up a client
    pub async fn get(&self, id: ConnectionId) -> Result<Arc<ClientHandle>, RegistryError> {
        self.inner
            .read()
            .await
            .clients
            .get(&id)
            .cloned()
            .ok_or(RegistryError::ConnectionNotFound(id))
    }

    /// Check if a client is registered
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().await.clients.contains_key(&id)
    }

    /// Handles of all registered clients
    pub async fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.inner.read().await.clients.values().cloned().collect()
    }

    /// Describe all registered clients, ordered by id
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<ClientInfo> = self.snapshot().await.iter().map(|h| h.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Remote addresses of all registered clients
    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.inner
            .read()
            .await
            .clients
            .values()
            .map(|h| h.peer_addr)
            .collect()
    }

    /// Number of registered clients
    pub async fn len(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    /// Check if no clients are registered
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.clients.is_empty()
    }

    /// Queue `payload` for every client.
    ///
    /// Clients whose queue is full or closed are closed and removed; the rest
    /// are unaffected.
    pub async fn broadcast(&self, payload: Bytes) -> BroadcastReport {
        let targets = self.snapshot().await;
        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();

        for handle in &targets {
            match handle.try_deliver(payload.clone()) {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    tracing::warn!(
                        connection_id = handle.id,
                        peer = %handle.peer_addr,
                        error = %e,
                        "Dropping client after failed delivery"
                    );
                    report.failed += 1;
                    dead.push(handle.id);
                }
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.write().await;
            for id in dead {
                if let Some(handle) = inner.clients.remove(&id) {
                    handle.close();
                }
            }
        }

        report
    }

    /// Stop accepting new clients and remove every current one.
    ///
    /// Returns the removed handles so the caller can close them.
    pub async fn drain(&self) -> Vec<Arc<ClientHandle>> {
        let mut inner = self.inner.write().await;
        inner.accepting = false;
        inner.clients.drain().map(|(_, handle)| handle).collect()
    }

    /// Accept clients again after a drain
    pub async fn reopen(&self) {
        self.inner.write().await.accepting = true;
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
