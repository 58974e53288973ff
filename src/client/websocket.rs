//! WebSocket transport
//!
//! One `tokio-tungstenite` client stream per transport. The same type serves
//! both publishers and subscribers; WebSocket endpoints have a single channel,
//! so the publish destination only shows up in logs.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::config::{EndpointOptions, WsConfig};
use super::transport::{Inbound, InboundTransport, OutboundTransport, Transport};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client transport
pub struct WsTransport {
    config: WsConfig,
    stream: Option<WsStream>,
}

impl WsTransport {
    /// Create a transport for the given endpoint (not yet connected)
    pub fn new(config: WsConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    /// Get the endpoint configuration
    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Check if a stream is currently held
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn build_request(&self) -> Result<Request> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::InvalidValue(format!("bad WebSocket URL `{}`: {}", self.config.url, e)))?;

        for (name, value) in &self.config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidValue(format!("bad header name `{}`: {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidValue(format!("bad value for header `{}`: {}", name, e)))?;
            request.headers_mut().insert(header_name, header_value);
        }

        Ok(request)
    }
}

impl Transport for WsTransport {
    fn endpoint(&self) -> &str {
        &self.config.url
    }

    fn options(&self) -> &EndpointOptions {
        &self.config.options
    }

    fn default_destination(&self) -> &str {
        &self.config.url
    }

    async fn connect(&mut self) -> Result<()> {
        self.config.validate()?;
        let request = self.build_request()?;

        // Drop any stale stream before the new handshake
        self.stream = None;

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| Error::connection(&self.config.url, e))?;

        tracing::info!(
            endpoint = %self.config.url,
            status = %response.status(),
            "WebSocket connected"
        );

        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                tracing::debug!(endpoint = %self.config.url, error = %e, "WebSocket close failed");
            }
        }
    }
}

impl OutboundTransport for WsTransport {
    async fn send(&mut self, destination: &str, payload: Bytes) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::NotConnected(self.config.url.clone()))?;

        let text = String::from_utf8(payload.to_vec())
            .map_err(|e| Error::InvalidRecord(format!("payload is not UTF-8: {}", e)))?;

        let result = stream.send(Message::Text(text.into())).await;
        if let Err(e) = result {
            // The stream is unusable after a failed write
            self.stream = None;
            return Err(Error::publish(destination, e));
        }

        Ok(())
    }
}

impl InboundTransport for WsTransport {
    async fn recv(&mut self) -> Result<Option<Inbound>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::NotConnected(self.config.url.clone()))?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Inbound {
                        source: self.config.url.clone(),
                        payload: Bytes::from(text),
                    }));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Inbound {
                        source: self.config.url.clone(),
                        payload: Bytes::from(data),
                    }));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(endpoint = %self.config.url, frame = ?frame, "Close frame received");
                    self.stream = None;
                    return Ok(None);
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(Error::connection(&self.config.url, e));
                }
                None => {
                    self.stream = None;
                    return Ok(None);
                }
            }
        }
    }
}
