//! Bridge endpoints
//!
//! The bridge mixes WebSocket and MQTT endpoints in one table, so the
//! generic publisher/subscriber types are wrapped in small enums here.

use serde::Serialize;

use crate::client::{
    ListenHandle, MessageHandler, MqttConfig, MqttPublisher, MqttSubscriber, Publisher, Subscriber,
    WsConfig, WsPublisher, WsSubscriber,
};
use crate::error::Result;
use crate::record::Record;
use crate::session::ConnectionState;

/// Where a bridge endpoint connects to
#[derive(Debug, Clone)]
pub enum EndpointConfig {
    WebSocket(WsConfig),
    Mqtt(MqttConfig),
}

impl EndpointConfig {
    /// Transport name, used in envelopes and status output
    pub fn kind(&self) -> &'static str {
        match self {
            EndpointConfig::WebSocket(_) => "websocket",
            EndpointConfig::Mqtt(_) => "mqtt",
        }
    }

    /// Endpoint label
    pub fn endpoint(&self) -> String {
        match self {
            EndpointConfig::WebSocket(config) => config.url.clone(),
            EndpointConfig::Mqtt(config) => config.endpoint(),
        }
    }
}

impl From<WsConfig> for EndpointConfig {
    fn from(config: WsConfig) -> Self {
        EndpointConfig::WebSocket(config)
    }
}

impl From<MqttConfig> for EndpointConfig {
    fn from(config: MqttConfig) -> Self {
        EndpointConfig::Mqtt(config)
    }
}

/// Status of one named endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub kind: &'static str,
    pub endpoint: String,
    pub state: ConnectionState,
}

impl EndpointStatus {
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

/// Outbound bridge endpoint
pub enum BridgePublisher {
    WebSocket(WsPublisher),
    Mqtt(MqttPublisher),
}

impl BridgePublisher {
    pub fn new(config: EndpointConfig) -> Self {
        match config {
            EndpointConfig::WebSocket(config) => BridgePublisher::WebSocket(Publisher::websocket(config)),
            EndpointConfig::Mqtt(config) => BridgePublisher::Mqtt(Publisher::mqtt(config)),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        match self {
            BridgePublisher::WebSocket(p) => p.connect().await,
            BridgePublisher::Mqtt(p) => p.connect().await,
        }
    }

    pub async fn publish(&self, record: &Record) -> Result<()> {
        match self {
            BridgePublisher::WebSocket(p) => p.publish(record, None).await,
            BridgePublisher::Mqtt(p) => p.publish(record, None).await,
        }
    }

    pub async fn disconnect(&self) {
        match self {
            BridgePublisher::WebSocket(p) => p.disconnect().await,
            BridgePublisher::Mqtt(p) => p.disconnect().await,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            BridgePublisher::WebSocket(p) => p.state(),
            BridgePublisher::Mqtt(p) => p.state(),
        }
    }

    pub fn status(&self) -> EndpointStatus {
        let (kind, endpoint) = match self {
            BridgePublisher::WebSocket(p) => ("websocket", p.endpoint()),
            BridgePublisher::Mqtt(p) => ("mqtt", p.endpoint()),
        };
        EndpointStatus {
            kind,
            endpoint: endpoint.to_string(),
            state: self.state(),
        }
    }
}

/// Inbound bridge endpoint
pub enum BridgeSubscriber<H: MessageHandler> {
    WebSocket(WsSubscriber<H>),
    Mqtt(MqttSubscriber<H>),
}

impl<H: MessageHandler> BridgeSubscriber<H> {
    pub fn new(config: EndpointConfig, handler: H) -> Self {
        match config {
            EndpointConfig::WebSocket(config) => {
                BridgeSubscriber::WebSocket(Subscriber::websocket(config, handler))
            }
            EndpointConfig::Mqtt(config) => BridgeSubscriber::Mqtt(Subscriber::mqtt(config, handler)),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        match self {
            BridgeSubscriber::WebSocket(s) => s.connect().await,
            BridgeSubscriber::Mqtt(s) => s.connect().await,
        }
    }

    pub fn start_listening_async(&self) -> Result<ListenHandle> {
        match self {
            BridgeSubscriber::WebSocket(s) => s.start_listening_async(),
            BridgeSubscriber::Mqtt(s) => s.start_listening_async(),
        }
    }

    pub async fn stop(&self) {
        match self {
            BridgeSubscriber::WebSocket(s) => s.stop().await,
            BridgeSubscriber::Mqtt(s) => s.stop().await,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            BridgeSubscriber::WebSocket(s) => s.state(),
            BridgeSubscriber::Mqtt(s) => s.state(),
        }
    }

    pub fn status(&self) -> EndpointStatus {
        let (kind, endpoint) = match self {
            BridgeSubscriber::WebSocket(s) => ("websocket", s.endpoint()),
            BridgeSubscriber::Mqtt(s) => ("mqtt", s.endpoint()),
        };
        EndpointStatus {
            kind,
            endpoint: endpoint.to_string(),
            state: self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_config_conversions() {
        let ws: EndpointConfig = WsConfig::new("ws://127.0.0.1:9000").into();
        assert_eq!(ws.kind(), "websocket");
        assert_eq!(ws.endpoint(), "ws://127.0.0.1:9000");

        let mqtt: EndpointConfig = MqttConfig::new("broker", "sensors/temp").into();
        assert_eq!(mqtt.kind(), "mqtt");
        assert_eq!(mqtt.endpoint(), "mqtt://broker:1883/sensors/temp");
    }

    #[test]
    fn test_new_publisher_is_disconnected() {
        let publisher = BridgePublisher::new(WsConfig::new("ws://127.0.0.1:9000").into());
        let status = publisher.status();

        assert_eq!(status.kind, "websocket");
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.is_connected());
    }
}
