//! Client endpoints
//!
//! Outbound [`Publisher`]s and inbound [`Subscriber`]s over:
//! - WebSocket (`tokio-tungstenite`), auto-reconnect on by default
//! - MQTT (`rumqttc`), failures returned to the caller

pub mod config;
pub mod handler;
pub mod mqtt;
pub mod publisher;
pub mod subscriber;
pub mod transport;
pub mod websocket;

pub use config::{EndpointOptions, MqttConfig, ReconnectPolicy, WsConfig};
pub use handler::{handler_fn, FnHandler, HandlerError, HandlerResult, MessageHandler};
pub use mqtt::{MqttInbound, MqttOutbound};
pub use publisher::{BatchFailure, BatchReport, Publisher};
pub use subscriber::{ListenHandle, ListenStats, Subscriber};
pub use transport::{Inbound, InboundTransport, OutboundTransport, Transport};
pub use websocket::WsTransport;

/// WebSocket publisher
pub type WsPublisher = Publisher<WsTransport>;

/// MQTT publisher
pub type MqttPublisher = Publisher<MqttOutbound>;

/// WebSocket subscriber
pub type WsSubscriber<H> = Subscriber<WsTransport, H>;

/// MQTT subscriber
pub type MqttSubscriber<H> = Subscriber<MqttInbound, H>;
