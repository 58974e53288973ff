//! Relay handlers
//!
//! Records crossing the bridge are wrapped in an envelope that names where
//! they came from and which bridges moved them. `relayed_by` holds the last
//! hop; `relay_path` lists every bridge the record has crossed, oldest first.
//! A record whose path already names this bridge is dropped, so a record
//! crosses a given bridge at most once however many relays sit in between.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::client::{HandlerResult, MessageHandler};
use crate::error::Error;
use crate::record::Record;
use crate::server::{ClientContext, ServerHandler, WeakServer};

use super::table::EndpointTable;

/// Envelope field holding the id of the bridge that relayed a record
pub const RELAYED_BY_FIELD: &str = "relayed_by";

/// Envelope field listing every bridge a record passed through
pub const RELAY_PATH_FIELD: &str = "relay_path";

/// Envelope field holding the wrapped record
pub const DATA_FIELD: &str = "data";

/// Callback replacing a subscriber's default relay to the server clients
pub type RecordCallback = Arc<dyn Fn(&str, Record) -> HandlerResult + Send + Sync>;

/// Id of the bridge that relayed `record`, if any
pub fn relayed_by(record: &Record) -> Option<&str> {
    record.get(RELAYED_BY_FIELD).and_then(Value::as_str)
}

/// Bridges `record` has passed through, oldest first.
///
/// Uses `relay_path` when present. Envelopes without one are unwrapped
/// through their nested `data` fields, collecting each `relayed_by` tag.
pub fn relay_path(record: &Record) -> Vec<String> {
    if let Some(Value::Array(path)) = record.get(RELAY_PATH_FIELD) {
        return path
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }

    let mut path = Vec::new();
    let mut level: Option<&Map<String, Value>> = Some(record.fields());
    while let Some(fields) = level {
        if let Some(id) = fields.get(RELAYED_BY_FIELD).and_then(Value::as_str) {
            path.push(id.to_string());
        }
        level = fields.get(DATA_FIELD).and_then(Value::as_object);
    }
    path.reverse();
    path
}

/// Whether `record` already crossed the bridge `bridge_id`
pub fn has_crossed(record: &Record, bridge_id: &str) -> bool {
    relay_path(record).iter().any(|id| id == bridge_id)
}

fn extended_path(bridge_id: &str, record: &Record) -> Value {
    let mut path = relay_path(record);
    path.push(bridge_id.to_string());
    Value::from(path)
}

pub(crate) fn subscriber_envelope(
    bridge_id: &str,
    kind: &str,
    subscriber_name: &str,
    origin: &str,
    record: Record,
) -> Record {
    let path = extended_path(bridge_id, &record);
    Record::stamped()
        .with("source", format!("{}_subscriber", kind))
        .with("subscriber_name", subscriber_name)
        .with("origin", origin)
        .with(RELAYED_BY_FIELD, bridge_id)
        .with(RELAY_PATH_FIELD, path)
        .with(DATA_FIELD, Value::from(record))
}

pub(crate) fn client_envelope(bridge_id: &str, ctx: &ClientContext, record: Record) -> Record {
    let path = extended_path(bridge_id, &record);
    Record::stamped()
        .with("source", "websocket_client")
        .with("client_address", ctx.peer_addr.to_string())
        .with("connection_id", ctx.connection_id)
        .with(RELAYED_BY_FIELD, bridge_id)
        .with(RELAY_PATH_FIELD, path)
        .with(DATA_FIELD, Value::from(record))
}

/// Forwards records from one named subscriber to the bridge's server clients
pub struct SubscriberRelay {
    bridge_id: Arc<str>,
    name: String,
    kind: &'static str,
    server: WeakServer<ClientRelay>,
    callback: Option<RecordCallback>,
}

impl SubscriberRelay {
    pub(crate) fn new(
        bridge_id: Arc<str>,
        name: impl Into<String>,
        kind: &'static str,
        server: WeakServer<ClientRelay>,
    ) -> Self {
        Self {
            bridge_id,
            name: name.into(),
            kind,
            server,
            callback: None,
        }
    }

    /// Hand records to `callback` instead of broadcasting them
    pub(crate) fn with_callback(mut self, callback: RecordCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl MessageHandler for SubscriberRelay {
    async fn on_message(&self, source: &str, record: Record) -> HandlerResult {
        if has_crossed(&record, &self.bridge_id) {
            tracing::debug!(subscriber = %self.name, "Dropping record already relayed by this bridge");
            return Ok(());
        }

        if let Some(callback) = &self.callback {
            return callback(source, record);
        }

        let Some(server) = self.server.upgrade() else {
            return Ok(());
        };

        let envelope = subscriber_envelope(&self.bridge_id, self.kind, &self.name, source, record);
        match server.broadcast(&envelope).await {
            Ok(report) => {
                tracing::debug!(
                    subscriber = %self.name,
                    sent = report.sent,
                    failed = report.failed,
                    "Relayed subscriber record to clients"
                );
                Ok(())
            }
            Err(Error::NotRunning) => {
                tracing::debug!(subscriber = %self.name, "Bridge server not running, record dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Server handler forwarding client records to every bridge publisher
pub struct ClientRelay {
    bridge_id: Arc<str>,
    table: Arc<EndpointTable>,
}

impl ClientRelay {
    pub(crate) fn new(bridge_id: Arc<str>, table: Arc<EndpointTable>) -> Self {
        Self { bridge_id, table }
    }
}

impl ServerHandler for ClientRelay {
    async fn on_connect(&self, ctx: &ClientContext) -> bool {
        tracing::info!(connection_id = ctx.connection_id, peer = %ctx.peer_addr, "Client connected to bridge");
        true
    }

    async fn on_message(&self, ctx: &ClientContext, record: Record) -> HandlerResult {
        if has_crossed(&record, &self.bridge_id) {
            tracing::debug!(connection_id = ctx.connection_id, "Dropping echoed bridge record");
            return Ok(());
        }

        let envelope = client_envelope(&self.bridge_id, ctx, record);
        let mut delivered = 0usize;

        for (name, publisher) in self.table.publishers().await {
            if !publisher.state().is_connected() {
                tracing::debug!(publisher = %name, "Skipping disconnected publisher");
                continue;
            }

            match publisher.publish(&envelope).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(publisher = %name, error = %e, "Bridge publish failed"),
            }
        }

        tracing::debug!(connection_id = ctx.connection_id, publishers = delivered, "Relayed client record");
        Ok(())
    }

    async fn on_disconnect(&self, ctx: &ClientContext) {
        tracing::info!(connection_id = ctx.connection_id, peer = %ctx.peer_addr, "Client disconnected from bridge");
    }
}
