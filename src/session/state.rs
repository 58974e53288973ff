//! Connection lifecycle state machines
//!
//! Every endpoint (publisher, subscriber, server client) owns one
//! [`StateCell`] holding its [`ConnectionState`]. The cell is backed by a
//! `tokio::sync::watch` channel so callers can observe transitions.

use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle state of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection (initial and terminal state)
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Handshake complete, I/O allowed
    Connected,
    /// Graceful close in progress
    Closing,
}

impl ConnectionState {
    /// Check if network I/O is valid in this state
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a broadcast server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Shared, observable holder of one connection's state
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
    endpoint: String,
}

impl StateCell {
    /// Create a new cell in the `Disconnected` state
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            endpoint: endpoint.into(),
        }
    }

    /// Current state
    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Endpoint label used in log output
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Subscribe to state changes
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Transition `Disconnected -> Connecting`.
    ///
    /// Returns false (and leaves the state alone) from any other state.
    pub fn begin_connect(&self) -> bool {
        self.transition(|s| s == ConnectionState::Disconnected, ConnectionState::Connecting)
    }

    /// Transition `Connecting -> Connected`.
    ///
    /// A close that raced the handshake wins: returns false unless the cell
    /// was still `Connecting`.
    pub fn mark_connected(&self) -> bool {
        self.transition(|s| s == ConnectionState::Connecting, ConnectionState::Connected)
    }

    /// Move to `Closing` from any live state. Returns the previous state.
    pub fn begin_close(&self) -> ConnectionState {
        let prev = self.get();
        self.transition(|s| s != ConnectionState::Disconnected, ConnectionState::Closing);
        prev
    }

    /// Move to `Disconnected` from any state
    pub fn mark_disconnected(&self) -> bool {
        self.transition(|_| true, ConnectionState::Disconnected)
    }

    fn transition(&self, allowed: impl Fn(ConnectionState) -> bool, next: ConnectionState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|state| {
            if *state != next && allowed(*state) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });

        if let Some(from) = from {
            tracing::debug!(
                endpoint = %self.endpoint,
                from = %from,
                to = %next,
                "Connection state changed"
            );
        }

        changed
    }
}
