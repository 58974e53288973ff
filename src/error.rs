//! Error types
//!
//! A single crate-wide error enum. Fan-out operations (broadcast, multi-sink
//! logging, batch publish) never return these for per-recipient failures; they
//! report them in their result structs instead.

use std::net::SocketAddr;

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Handshake or transport failure while establishing a connection
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    /// Write failure on an established connection
    #[error("publish to {destination} failed: {reason}")]
    Publish { destination: String, reason: String },

    /// Operation requires the `Connected` state
    #[error("not connected to {0}")]
    NotConnected(String),

    /// A listen loop is already running for this subscriber
    #[error("already listening on {0}")]
    AlreadyListening(String),

    /// Server operation attempted while the server is not running
    #[error("server is not running")]
    NotRunning,

    /// Bounded buffer is at capacity and must be drained first
    #[error("buffer full (capacity {capacity})")]
    BufferFull { capacity: usize },

    /// Server could not acquire its listening address
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Record failed validation (missing or malformed field)
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Invalid input value (sensor range, endpoint URL, topic, ...)
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A log sink rejected a record
    #[error("sink error: {0}")]
    Sink(String),

    /// Operation exceeded its configured timeout
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u64 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV encode/decode error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub(crate) fn connection(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Error::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn publish(destination: impl Into<String>, reason: impl ToString) -> Self {
        Error::Publish {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn timeout(operation: &'static str, after: std::time::Duration) -> Self {
        Error::Timeout {
            operation,
            millis: after.as_millis() as u64,
        }
    }

    /// Whether this error means the underlying link is gone
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::Publish { .. } | Error::NotConnected(_) | Error::Timeout { .. }
        )
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::connection("ws://localhost:9000", "refused");
        assert_eq!(
            err.to_string(),
            "connection to ws://localhost:9000 failed: refused"
        );

        let err = Error::BufferFull { capacity: 3 };
        assert_eq!(err.to_string(), "buffer full (capacity 3)");

        let err = Error::timeout("handshake", std::time::Duration::from_millis(250));
        assert_eq!(err.to_string(), "handshake timed out after 250ms");
    }

    #[test]
    fn test_link_failure_classification() {
        assert!(Error::publish("sensors/t", "closed").is_link_failure());
        assert!(Error::NotConnected("x".into()).is_link_failure());
        assert!(!Error::InvalidRecord("no timestamp".into()).is_link_failure());
        assert!(!Error::BufferFull { capacity: 1 }.is_link_failure());
    }
}
