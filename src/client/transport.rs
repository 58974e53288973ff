//! Transport abstraction
//!
//! Publishers and subscribers are generic over a transport. A transport owns
//! exactly one underlying connection and knows how to (re)establish it; the
//! lifecycle state, timeouts and reconnect policy live in the endpoint that
//! wraps it.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use super::config::EndpointOptions;
use crate::error::{Error, Result};
use crate::session::{ConnectionState, StateCell};

/// A message read from an inbound transport
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Topic (MQTT) or endpoint URL (WebSocket) the payload arrived on
    pub source: String,
    /// Raw payload, expected to be a UTF-8 JSON object
    pub payload: Bytes,
}

/// Behaviour shared by every transport
pub trait Transport: Send + 'static {
    /// Endpoint label used in logs and errors
    fn endpoint(&self) -> &str;

    /// Timeouts and reconnect policy for this endpoint
    fn options(&self) -> &EndpointOptions;

    /// Default topic or channel for outbound messages
    fn default_destination(&self) -> &str;

    /// Perform the handshake. Replaces any previous connection.
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Close the connection. Must be safe to call when not connected.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// A transport that can write records
pub trait OutboundTransport: Transport {
    /// Write one serialized record to `destination`
    fn send(&mut self, destination: &str, payload: Bytes)
        -> impl Future<Output = Result<()>> + Send;
}

/// A transport that can read records
pub trait InboundTransport: Transport {
    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Inbound>>> + Send;
}

/// Run a transport handshake bounded by the configured connect timeout
pub(crate) async fn connect_with_timeout<T: Transport>(transport: &mut T) -> Result<()> {
    let limit = transport.options().connect_timeout;

    match tokio::time::timeout(limit, transport.connect()).await {
        Ok(result) => result,
        Err(_) => {
            transport.close().await;
            Err(Error::connection(
                transport.endpoint(),
                Error::timeout("handshake", limit),
            ))
        }
    }
}

/// Drive `state` through a handshake on an already-locked transport.
///
/// Succeeds immediately when already connected. A close that lands while the
/// handshake is in flight wins and the fresh connection is dropped.
pub(crate) async fn establish<T: Transport>(transport: &mut T, state: &StateCell) -> Result<()> {
    if !state.begin_connect() {
        return match state.get() {
            ConnectionState::Connected => Ok(()),
            other => Err(Error::connection(
                transport.endpoint(),
                format!("cannot connect while {}", other),
            )),
        };
    }

    match connect_with_timeout(transport).await {
        Ok(()) if state.mark_connected() => Ok(()),
        Ok(()) => {
            transport.close().await;
            state.mark_disconnected();
            Err(Error::connection(transport.endpoint(), "closed during handshake"))
        }
        Err(e) => {
            state.mark_disconnected();
            Err(e)
        }
    }
}

/// Run a single send bounded by `limit`
pub(crate) async fn send_with_timeout<T: OutboundTransport>(
    transport: &mut T,
    destination: &str,
    payload: Bytes,
    limit: Duration,
) -> Result<()> {
    match tokio::time::timeout(limit, transport.send(destination, payload)).await {
        Ok(result) => result,
        Err(_) => Err(Error::publish(destination, Error::timeout("send", limit))),
    }
}

/// Resolve once the stop flag is raised (or its sender is gone)
pub(crate) async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
