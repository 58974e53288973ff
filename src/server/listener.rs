//! Broadcast server listener
//!
//! Owns the TCP accept loop, spawns one [`Connection`] task per client, and
//! fans records out through the [`ClientRegistry`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::client::transport::stop_requested;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::registry::{BroadcastReport, ClientInfo, ClientRegistry, ConnectionId};
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::server::handler::ServerHandler;
use crate::session::ServerState;
use crate::stats::{ServerCounters, ServerStats};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// WebSocket broadcast server
///
/// Cheap to clone; clones share the same listener and client set.
///
/// # Example
/// ```no_run
/// use iotkit_rs::server::{BroadcastServer, NullHandler, ServerConfig};
/// use iotkit_rs::Record;
///
/// # async fn example() -> iotkit_rs::Result<()> {
/// let server = BroadcastServer::new(ServerConfig::default(), NullHandler);
/// let addr = server.start().await?;
/// println!("listening on {}", addr);
///
/// let report = server.broadcast(&Record::stamped().with("humidity", 41)).await?;
/// println!("sent to {} clients", report.sent);
///
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct BroadcastServer<H: ServerHandler> {
    inner: Arc<ServerInner<H>>,
}

impl<H: ServerHandler> Clone for BroadcastServer<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning reference to a [`BroadcastServer`]
pub struct WeakServer<H: ServerHandler> {
    inner: Weak<ServerInner<H>>,
}

impl<H: ServerHandler> Clone for WeakServer<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<H: ServerHandler> WeakServer<H> {
    /// Get the server back if it still exists
    pub fn upgrade(&self) -> Option<BroadcastServer<H>> {
        self.inner.upgrade().map(|inner| BroadcastServer { inner })
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

struct ServerInner<H: ServerHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    registry: Arc<ClientRegistry>,
    counters: Arc<ServerCounters>,
    next_connection_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    state: watch::Sender<ServerState>,
    running: parking_lot::Mutex<Option<Running>>,
    live_connections: Arc<watch::Sender<usize>>,
    lifecycle: Mutex<()>,
}

/// Decrements the live connection count when a connection task ends
struct LiveGuard(Arc<watch::Sender<usize>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl<H: ServerHandler> BroadcastServer<H> {
    /// Create a new server with the given configuration and handler
    pub fn new(config: ServerConfig, handler: H) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        let (state, _) = watch::channel(ServerState::Stopped);
        let (live_connections, _) = watch::channel(0usize);

        Self {
            inner: Arc::new(ServerInner {
                config,
                handler: Arc::new(handler),
                registry: Arc::new(ClientRegistry::new()),
                counters: Arc::new(ServerCounters::new()),
                next_connection_id: AtomicU64::new(1),
                connection_semaphore,
                state,
                running: parking_lot::Mutex::new(None),
                live_connections: Arc::new(live_connections),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Bind and start accepting clients.
    ///
    /// Returns the bound address (useful with port 0). Calling `start` on a
    /// running server returns its address without rebinding.
    pub async fn start(&self) -> Result<SocketAddr> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        self.inner.state.send_replace(ServerState::Starting);

        let bind_addr = self.inner.config.bind_addr;
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.inner.state.send_replace(ServerState::Stopped);
                return Err(Error::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.inner.state.send_replace(ServerState::Stopped);
                return Err(e.into());
            }
        };

        self.inner.registry.reopen().await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let accept_task = tokio::spawn(accept_loop(weak, listener, shutdown_rx));

        *self.inner.running.lock() = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });

        self.inner.counters.mark_started();
        self.inner.state.send_replace(ServerState::Running);
        tracing::info!(addr = %local_addr, "Broadcast server listening");

        Ok(local_addr)
    }

    /// Stop accepting, close every client, and return to `Stopped`.
    ///
    /// Idempotent. Waits (bounded) for connection tasks to finish their
    /// disconnect callbacks.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let Some(running) = self.inner.running.lock().take() else {
            return;
        };

        self.inner.state.send_replace(ServerState::Stopping);

        running.shutdown.send_replace(true);
        if let Err(e) = running.accept_task.await {
            tracing::warn!(error = %e, "Accept loop ended abnormally");
        }

        let clients = self.inner.registry.drain().await;
        for client in &clients {
            client.close();
        }

        let grace = self.inner.config.send_timeout + self.inner.config.handshake_timeout;
        let mut live = self.inner.live_connections.subscribe();
        if tokio::time::timeout(grace, live.wait_for(|n| *n == 0)).await.is_err() {
            tracing::warn!(
                remaining = *live.borrow(),
                "Connection tasks still running after shutdown grace period"
            );
        }

        self.inner.counters.mark_stopped();
        self.inner.state.send_replace(ServerState::Stopped);
        tracing::info!(
            addr = %running.local_addr,
            clients = clients.len(),
            "Broadcast server stopped"
        );
    }

    /// Send a record to every connected client.
    ///
    /// Serializes once. Clients that cannot take the message are removed;
    /// that is reported, not returned as an error.
    pub async fn broadcast(&self, record: &Record) -> Result<BroadcastReport> {
        self.ensure_running()?;

        let payload = record.to_payload()?;
        let report = self.inner.registry.broadcast(payload).await;
        self.inner.counters.broadcast_done(report.sent, report.failed);

        tracing::debug!(sent = report.sent, failed = report.failed, "Broadcast complete");
        Ok(report)
    }

    /// Send a record to one client
    pub async fn send_to(&self, id: ConnectionId, record: &Record) -> Result<()> {
        self.ensure_running()?;

        let payload = record.to_payload()?;
        let label = format!("connection {}", id);
        let handle = self
            .inner
            .registry
            .get(id)
            .await
            .map_err(|_| Error::NotConnected(label.clone()))?;

        match handle.try_deliver(payload) {
            Ok(()) => {
                self.inner.counters.record_deliveries(1, 0);
                Ok(())
            }
            Err(e) => {
                self.inner.registry.unregister(id).await;
                handle.close();
                self.inner.counters.record_deliveries(0, 1);
                tracing::warn!(connection_id = id, error = %e, "Dropping client after failed delivery");
                Err(Error::publish(label, e))
            }
        }
    }

    /// Number of connected clients
    pub async fn client_count(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Describe connected clients
    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.inner.registry.clients().await
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle changes
    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ServerStats {
        self.inner.counters.snapshot()
    }

    /// Get a reference to the client registry
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.inner.registry
    }

    /// Get the handler
    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    /// Get the configuration
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Non-owning reference, for handlers that need to reach the server
    pub fn downgrade(&self) -> WeakServer<H> {
        WeakServer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state() == ServerState::Running {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }
}

async fn accept_loop<H: ServerHandler>(
    server: Weak<ServerInner<H>>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    let Some(inner) = server.upgrade() else { break };
                    inner.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    tracing::debug!("Accept loop stopped");
}

impl<H: ServerHandler> ServerInner<H> {
    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = match self.connection_semaphore {
            Some(ref sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    self.counters.connection_rejected();
                    return;
                }
            },
            None => None,
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(connection_id = connection_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::warn!(connection_id = connection_id, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let connection = Connection::new(
            connection_id,
            socket,
            peer_addr,
            self.config.clone(),
            Arc::clone(&self.handler),
            Arc::clone(&self.registry),
            Arc::clone(&self.counters),
        );

        self.live_connections.send_modify(|n| *n += 1);
        let live = LiveGuard(Arc::clone(&self.live_connections));

        tokio::spawn(async move {
            let _permit = permit;
            let _live = live;

            if let Err(e) = connection.run().await {
                tracing::debug!(connection_id = connection_id, error = %e, "Connection error");
            }
        });
    }
}
