//! Registry error types

use super::entry::ConnectionId;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A client with this id is already registered
    DuplicateConnection(ConnectionId),
    /// No client with this id
    ConnectionNotFound(ConnectionId),
    /// The client's outbound queue is full
    QueueFull(ConnectionId),
    /// The client is closing or its writer has exited
    Closed(ConnectionId),
    /// The registry no longer accepts clients (server stopping)
    NotAccepting,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateConnection(id) => write!(f, "Connection already registered: {}", id),
            RegistryError::ConnectionNotFound(id) => write!(f, "Connection not found: {}", id),
            RegistryError::QueueFull(id) => write!(f, "Outbound queue full for connection {}", id),
            RegistryError::Closed(id) => write!(f, "Connection closed: {}", id),
            RegistryError::NotAccepting => write!(f, "Registry is not accepting connections"),
        }
    }
}

impl std::error::Error for RegistryError {}
