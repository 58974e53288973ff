//! iotkit-rs: messaging layer for IoT sensor records
//!
//! Records are JSON objects carrying at least a `timestamp` field. They move
//! between components over two transports:
//!
//! - WebSocket, via [`client::WsPublisher`] / [`client::WsSubscriber`] and the
//!   multi-client [`BroadcastServer`]
//! - MQTT, via [`client::MqttPublisher`] / [`client::MqttSubscriber`]
//!
//! A [`Bridge`] relays records between a broadcast server and any number of
//! named publishers and subscribers. Locally, [`BoundedBuffer`] batches
//! records and [`MultiSink`] writes them to several durable sinks at once.
//!
//! # Publishing
//!
//! ```no_run
//! use iotkit_rs::client::{Publisher, WsConfig};
//! use iotkit_rs::Record;
//!
//! # async fn run() -> iotkit_rs::Result<()> {
//! let publisher = Publisher::websocket(WsConfig::new("ws://127.0.0.1:8765"));
//! publisher.connect().await?;
//! publisher
//!     .publish(&Record::stamped().with("temperature", 21.5), None)
//!     .await?;
//! publisher.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Serving
//!
//! ```no_run
//! use iotkit_rs::server::{BroadcastServer, NullHandler, ServerConfig};
//! use iotkit_rs::Record;
//!
//! # async fn run() -> iotkit_rs::Result<()> {
//! let server = BroadcastServer::new(ServerConfig::default(), NullHandler);
//! let addr = server.start().await?;
//! println!("listening on {}", addr);
//!
//! let report = server.broadcast(&Record::stamped().with("alert", "high")).await?;
//! println!("delivered to {} clients", report.sent);
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod client;
pub mod error;
pub mod record;
pub mod registry;
pub mod sensor;
pub mod server;
pub mod session;
pub mod sink;
pub mod stats;

pub use bridge::{Bridge, BridgeStatus, EndpointConfig};
pub use client::{MessageHandler, MqttConfig, Publisher, ReconnectPolicy, Subscriber, WsConfig};
pub use error::{Error, Result};
pub use record::Record;
pub use sensor::{ManualSensor, RandomSensor, SensorCollection, SensorSource};
pub use server::{BroadcastServer, ServerConfig, ServerHandler};
pub use session::{ConnectionState, ServerState};
pub use sink::{BoundedBuffer, CsvSink, JsonLinesSink, LogSink, MultiSink};
pub use stats::ServerStats;
