//! MQTT transports
//!
//! Built on `rumqttc`. The client library needs its event loop polled to make
//! progress, so the two directions differ:
//!
//! - [`MqttOutbound`] drives the event loop from a background task and only
//!   enqueues publishes; when that task sees a connection error it marks the
//!   link down and stops (no internal retry).
//! - [`MqttInbound`] polls the event loop directly from `recv`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::task::JoinHandle;

use super::config::{validate_topic, EndpointOptions, MqttConfig};
use super::transport::{Inbound, InboundTransport, OutboundTransport, Transport};
use crate::error::{Error, Result};

/// How long `close` waits for the disconnect packet to go out
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn client_id(config: &MqttConfig, role: &str) -> String {
    config.client_id.clone().unwrap_or_else(|| {
        format!(
            "iotkit_{}_{}_{}",
            role,
            chrono::Utc::now().timestamp_millis(),
            CLIENT_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    })
}

fn mqtt_options(config: &MqttConfig, role: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id(config, role), config.broker.clone(), config.port);
    options.set_keep_alive(config.keep_alive);

    if let Some((username, password)) = &config.credentials {
        options.set_credentials(username.clone(), password.clone());
    }

    options
}

/// Create a client and poll until the broker acknowledges the connection
async fn handshake(config: &MqttConfig, endpoint: &str, role: &str) -> Result<(AsyncClient, EventLoop)> {
    config.validate()?;

    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, role), config.request_capacity);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok((client, eventloop));
                }
                return Err(Error::connection(
                    endpoint,
                    format!("broker refused connection: {:?}", ack.code),
                ));
            }
            Ok(_) => continue,
            Err(e) => return Err(Error::connection(endpoint, e)),
        }
    }
}

/// Publishing side of an MQTT connection
pub struct MqttOutbound {
    config: MqttConfig,
    endpoint: String,
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    link_up: Arc<AtomicBool>,
}

impl MqttOutbound {
    pub fn new(config: MqttConfig) -> Self {
        let endpoint = config.endpoint();
        Self {
            config,
            endpoint,
            client: None,
            driver: None,
            link_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the endpoint configuration
    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    /// Check if the event loop is still running
    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    fn spawn_driver(&mut self, mut eventloop: EventLoop) {
        let link_up = Arc::clone(&self.link_up);
        let endpoint = self.endpoint.clone();
        link_up.store(true, Ordering::SeqCst);

        self.driver = Some(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        tracing::debug!(endpoint = %endpoint, "MQTT disconnect sent");
                        break;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        tracing::info!(endpoint = %endpoint, "Broker closed MQTT connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "MQTT event loop stopped");
                        break;
                    }
                }
            }
            link_up.store(false, Ordering::SeqCst);
        }));
    }
}

impl Transport for MqttOutbound {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn options(&self) -> &EndpointOptions {
        &self.config.options
    }

    fn default_destination(&self) -> &str {
        &self.config.topic
    }

    async fn connect(&mut self) -> Result<()> {
        self.close().await;

        let (client, eventloop) = handshake(&self.config, &self.endpoint, "pub").await?;
        self.client = Some(client);
        self.spawn_driver(eventloop);

        tracing::info!(endpoint = %self.endpoint, "Connected to MQTT broker");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "MQTT disconnect request failed");
            }
        }

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut driver).await.is_err() {
                driver.abort();
            }
        }

        self.link_up.store(false, Ordering::SeqCst);
    }
}

impl OutboundTransport for MqttOutbound {
    async fn send(&mut self, destination: &str, payload: Bytes) -> Result<()> {
        validate_topic(destination)?;

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::NotConnected(self.endpoint.clone()))?;

        if !self.link_up.load(Ordering::SeqCst) {
            return Err(Error::publish(destination, "MQTT link is down"));
        }

        client
            .publish(destination, qos_from_u8(self.config.qos), false, payload.to_vec())
            .await
            .map_err(|e| Error::publish(destination, e))
    }
}

/// Subscribing side of an MQTT connection
pub struct MqttInbound {
    config: MqttConfig,
    endpoint: String,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
}

impl MqttInbound {
    pub fn new(config: MqttConfig) -> Self {
        let endpoint = config.endpoint();
        Self {
            config,
            endpoint,
            client: None,
            eventloop: None,
        }
    }

    /// Get the endpoint configuration
    pub fn config(&self) -> &MqttConfig {
        &self.config
    }
}

impl Transport for MqttInbound {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn options(&self) -> &EndpointOptions {
        &self.config.options
    }

    fn default_destination(&self) -> &str {
        &self.config.topic
    }

    async fn connect(&mut self) -> Result<()> {
        self.close().await;

        let (client, eventloop) = handshake(&self.config, &self.endpoint, "sub").await?;

        // Queued now, sent on the next poll
        client
            .subscribe(self.config.topic.as_str(), qos_from_u8(self.config.qos))
            .await
            .map_err(|e| Error::connection(&self.endpoint, e))?;

        tracing::info!(
            endpoint = %self.endpoint,
            topic = %self.config.topic,
            "Connected to MQTT broker, subscription requested"
        );

        self.client = Some(client);
        self.eventloop = Some(eventloop);
        Ok(())
    }

    async fn close(&mut self) {
        let Some(client) = self.client.take() else {
            self.eventloop = None;
            return;
        };

        if client.disconnect().await.is_ok() {
            if let Some(eventloop) = self.eventloop.as_mut() {
                // Flush the disconnect packet
                let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
                    loop {
                        match eventloop.poll().await {
                            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                })
                .await;
            }
        }

        self.eventloop = None;
    }
}

impl InboundTransport for MqttInbound {
    async fn recv(&mut self) -> Result<Option<Inbound>> {
        let eventloop = self
            .eventloop
            .as_mut()
            .ok_or_else(|| Error::NotConnected(self.endpoint.clone()))?;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(Inbound {
                        source: publish.topic,
                        payload: publish.payload,
                    }));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    tracing::debug!(endpoint = %self.endpoint, pkid = ack.pkid, "Subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.eventloop = None;
                    self.client = None;
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) => {
                    self.eventloop = None;
                    self.client = None;
                    return Err(Error::connection(&self.endpoint, e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }

    #[test]
    fn test_generated_client_ids_are_unique() {
        let config = MqttConfig::new("localhost", "sensors/a");
        let first = client_id(&config, "pub");
        let second = client_id(&config, "pub");

        assert!(first.starts_with("iotkit_pub_"));
        assert_ne!(first, second);

        let fixed = MqttConfig::new("localhost", "sensors/a").client_id("station-7");
        assert_eq!(client_id(&fixed, "sub"), "station-7");
    }

    #[tokio::test]
    async fn test_publish_before_connect() {
        let mut transport = MqttOutbound::new(MqttConfig::new("localhost", "sensors/a"));

        let result = transport.send("sensors/a", Bytes::from_static(b"{}")).await;
        assert!(matches!(result, Err(Error::NotConnected(_))));

        let result = transport.send("/bad/", Bytes::from_static(b"{}")).await;
        assert!(matches!(result, Err(Error::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = MqttInbound::new(MqttConfig::new("127.0.0.1", "sensors/#").port(port));
        assert!(matches!(
            transport.connect().await,
            Err(Error::Connection { .. })
        ));

        // Still safe to close and to read (reports not connected)
        transport.close().await;
        assert!(matches!(transport.recv().await, Err(Error::NotConnected(_))));
    }
}
