//! Cross-protocol bridge
//!
//! A [`Bridge`] runs one [`BroadcastServer`] and a dynamic table of named
//! outbound publishers and inbound subscribers:
//!
//! ```text
//!   [MQTT / WS subscribers] ──► SubscriberRelay ──► server.broadcast() ──► WS clients
//!   WS clients ──► ClientRelay ──► every connected publisher ──► [MQTT / WS]
//! ```
//!
//! Relayed records are wrapped in an envelope tagged with the bridge id in
//! `relayed_by` and appended to `relay_path`; records whose path already
//! names this bridge are not relayed again.

pub mod endpoint;
pub mod relay;
mod table;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::client::HandlerResult;
use crate::error::Result;
use crate::record::Record;
use crate::server::{BroadcastServer, ServerConfig};
use crate::session::ServerState;

pub use endpoint::{BridgePublisher, BridgeSubscriber, EndpointConfig, EndpointStatus};
pub use relay::{
    has_crossed, relay_path, relayed_by, ClientRelay, RecordCallback, SubscriberRelay, DATA_FIELD,
    RELAYED_BY_FIELD, RELAY_PATH_FIELD,
};

use table::{EndpointTable, SubscriberEntry};

static BRIDGE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Point-in-time view of a bridge
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub id: String,
    pub server_state: ServerState,
    pub server_addr: Option<SocketAddr>,
    pub server_clients: usize,
    pub publishers: BTreeMap<String, EndpointStatus>,
    pub subscribers: BTreeMap<String, EndpointStatus>,
}

/// Relay between a broadcast server and named publishers/subscribers
pub struct Bridge {
    id: Arc<str>,
    server: BroadcastServer<ClientRelay>,
    table: Arc<EndpointTable>,
}

impl Bridge {
    /// Create a bridge with a generated id
    pub fn new(config: ServerConfig) -> Self {
        let id = format!(
            "bridge-{}-{}",
            std::process::id(),
            BRIDGE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self::with_id(config, id)
    }

    /// Create a bridge with a fixed id (used for `relayed_by` tagging)
    pub fn with_id(config: ServerConfig, id: impl Into<String>) -> Self {
        let id: Arc<str> = Arc::from(id.into());
        let table = Arc::new(EndpointTable::new());
        let relay = ClientRelay::new(Arc::clone(&id), Arc::clone(&table));

        Self {
            id,
            server: BroadcastServer::new(config, relay),
            table,
        }
    }

    /// Bridge id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The bridge's broadcast server
    pub fn server(&self) -> &BroadcastServer<ClientRelay> {
        &self.server
    }

    /// Start the broadcast server
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self.server.start().await?;
        tracing::info!(bridge = %self.id, addr = %addr, "Bridge started");
        Ok(addr)
    }

    /// Close every endpoint and stop the server
    pub async fn stop(&self) {
        let (publishers, mut subscribers) = self.table.drain().await;

        for publisher in &publishers {
            publisher.disconnect().await;
        }
        for entry in &subscribers {
            entry.subscriber.stop().await;
        }
        for entry in subscribers.iter_mut() {
            if let Some(listener) = entry.listener.take() {
                listener.join().await;
            }
        }

        self.server.stop().await;
        tracing::info!(
            bridge = %self.id,
            publishers = publishers.len(),
            subscribers = subscribers.len(),
            "Bridge stopped"
        );
    }

    /// Add (or replace) a named outbound endpoint and connect it.
    ///
    /// A failed connect is returned, but the entry is kept in the table as
    /// disconnected (and keeps retrying if its endpoint reconnects).
    pub async fn add_publisher(&self, name: impl Into<String>, endpoint: impl Into<EndpointConfig>) -> Result<()> {
        let name = name.into();
        let config = endpoint.into();
        let label = config.endpoint();

        if let Some(old) = self.table.remove_publisher(&name).await {
            old.disconnect().await;
            tracing::info!(bridge = %self.id, publisher = %name, "Replacing publisher");
        }

        let publisher = Arc::new(BridgePublisher::new(config));
        let result = publisher.connect().await;

        // A concurrent add for the same name may have landed while connecting
        if let Some(old) = self.table.insert_publisher(name.clone(), publisher).await {
            old.disconnect().await;
            tracing::info!(bridge = %self.id, publisher = %name, "Replaced concurrently added publisher");
        }

        match &result {
            Ok(()) => tracing::info!(bridge = %self.id, publisher = %name, endpoint = %label, "Publisher added"),
            Err(e) => tracing::warn!(
                bridge = %self.id,
                publisher = %name,
                endpoint = %label,
                error = %e,
                "Publisher added but not connected"
            ),
        }

        result
    }

    /// Add (or replace) a named inbound endpoint, connect it, and start
    /// relaying its records to the server's clients.
    ///
    /// A failed connect is returned, but the entry is kept in the table as
    /// disconnected.
    pub async fn add_subscriber(&self, name: impl Into<String>, endpoint: impl Into<EndpointConfig>) -> Result<()> {
        self.insert_subscriber(name.into(), endpoint.into(), None).await
    }

    /// Like [`add_subscriber`](Self::add_subscriber), but records go to
    /// `callback` instead of the server's clients.
    ///
    /// Records that already crossed this bridge are still dropped first.
    pub async fn add_subscriber_with_callback<F>(
        &self,
        name: impl Into<String>,
        endpoint: impl Into<EndpointConfig>,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&str, Record) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert_subscriber(name.into(), endpoint.into(), Some(Arc::new(callback)))
            .await
    }

    async fn insert_subscriber(
        &self,
        name: String,
        config: EndpointConfig,
        callback: Option<RecordCallback>,
    ) -> Result<()> {
        let label = config.endpoint();

        if let Some(old) = self.table.remove_subscriber(&name).await {
            close_subscriber(old).await;
            tracing::info!(bridge = %self.id, subscriber = %name, "Replacing subscriber");
        }

        let mut relay = SubscriberRelay::new(
            Arc::clone(&self.id),
            name.clone(),
            config.kind(),
            self.server.downgrade(),
        );
        if let Some(callback) = callback {
            relay = relay.with_callback(callback);
        }
        let subscriber = Arc::new(BridgeSubscriber::new(config, relay));

        let result = subscriber.connect().await;

        // Reconnecting endpoints listen even after a failed connect
        let listener = match subscriber.start_listening_async() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::debug!(bridge = %self.id, subscriber = %name, error = %e, "Listen loop not started");
                None
            }
        };

        let entry = SubscriberEntry {
            subscriber,
            listener,
        };
        if let Some(old) = self.table.insert_subscriber(name.clone(), entry).await {
            close_subscriber(old).await;
            tracing::info!(bridge = %self.id, subscriber = %name, "Replaced concurrently added subscriber");
        }

        match &result {
            Ok(()) => tracing::info!(bridge = %self.id, subscriber = %name, endpoint = %label, "Subscriber added"),
            Err(e) => tracing::warn!(
                bridge = %self.id,
                subscriber = %name,
                endpoint = %label,
                error = %e,
                "Subscriber added but not connected"
            ),
        }

        result
    }

    /// Disconnect and forget a publisher. Returns false if the name is unknown.
    pub async fn remove_publisher(&self, name: &str) -> bool {
        match self.table.remove_publisher(name).await {
            Some(publisher) => {
                publisher.disconnect().await;
                tracing::info!(bridge = %self.id, publisher = %name, "Publisher removed");
                true
            }
            None => false,
        }
    }

    /// Stop and forget a subscriber. Returns false if the name is unknown.
    pub async fn remove_subscriber(&self, name: &str) -> bool {
        match self.table.remove_subscriber(name).await {
            Some(entry) => {
                close_subscriber(entry).await;
                tracing::info!(bridge = %self.id, subscriber = %name, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Names of the configured publishers
    pub async fn publisher_names(&self) -> Vec<String> {
        self.table.publisher_names().await
    }

    /// Names of the configured subscribers
    pub async fn subscriber_names(&self) -> Vec<String> {
        self.table.subscriber_names().await
    }

    /// Snapshot of the server and every endpoint
    pub async fn get_status(&self) -> BridgeStatus {
        BridgeStatus {
            id: self.id.to_string(),
            server_state: self.server.state(),
            server_addr: self.server.local_addr(),
            server_clients: self.server.client_count().await,
            publishers: self.table.publisher_status().await,
            subscribers: self.table.subscriber_status().await,
        }
    }
}

/// Stop a subscriber and wait for its listen loop to exit
async fn close_subscriber(entry: SubscriberEntry) {
    entry.subscriber.stop().await;
    if let Some(listener) = entry.listener {
        listener.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WsConfig;
    use crate::session::ConnectionState;

    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        format!("ws://127.0.0.1:{}", port)
    }

    #[tokio::test]
    async fn test_failed_endpoint_is_recorded() {
        let bridge = Bridge::with_id(ServerConfig::with_addr("127.0.0.1:0".parse().unwrap()), "b1");
        let url = closed_port_url();

        let result = bridge
            .add_publisher("downstream", WsConfig::new(url).no_reconnect())
            .await;
        assert!(result.is_err());

        let status = bridge.get_status().await;
        assert_eq!(status.id, "b1");
        assert_eq!(status.server_state, ServerState::Stopped);
        assert_eq!(status.publishers["downstream"].state, ConnectionState::Disconnected);

        assert!(bridge.remove_publisher("downstream").await);
        assert!(!bridge.remove_publisher("downstream").await);
        assert!(bridge.publisher_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_generated_ids_differ() {
        let config = ServerConfig::with_addr("127.0.0.1:0".parse().unwrap());
        let a = Bridge::new(config.clone());
        let b = Bridge::new(config);

        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("bridge-"));
    }
}
