//! Client endpoint configuration
//!
//! Builder-style configuration for outbound (publisher) and inbound
//! (subscriber) endpoints. Values are assumed to come from an already
//! validated configuration source; `validate()` only checks the shape of
//! addresses and topics.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Capped exponential backoff for reconnect loops
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between attempts (>= 1.0)
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with the given bounds and a doubling multiplier
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: 2.0,
        }
    }

    /// Set the growth factor (values below 1.0 are clamped to 1.0)
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Delay to wait before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

/// Timeouts and reconnect behaviour shared by every endpoint kind
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Handshake must complete within this time
    pub connect_timeout: Duration,

    /// A single send attempt must complete within this time
    pub send_timeout: Duration,

    /// Reconnect policy; `None` leaves retries to the caller
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            reconnect: None,
        }
    }
}

/// WebSocket endpoint configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Server URL (`ws://` or `wss://`)
    pub url: String,

    /// Extra HTTP headers sent with the upgrade request
    pub headers: Vec<(String, String)>,

    /// Timeouts and reconnect policy
    pub options: EndpointOptions,
}

impl WsConfig {
    /// Create a config for the given URL. Auto-reconnect is on by default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            options: EndpointOptions {
                reconnect: Some(ReconnectPolicy::default()),
                ..Default::default()
            },
        }
    }

    /// Add an upgrade request header (e.g. an opaque auth token)
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set handshake timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Set send timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.options.send_timeout = timeout;
        self
    }

    /// Set the reconnect policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.options.reconnect = Some(policy);
        self
    }

    /// Disable auto-reconnect
    pub fn no_reconnect(mut self) -> Self {
        self.options.reconnect = None;
        self
    }

    /// Check the URL scheme
    pub fn validate(&self) -> Result<()> {
        validate_ws_url(&self.url)
    }
}

/// MQTT endpoint configuration
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host name or address
    pub broker: String,

    /// Broker port
    pub port: u16,

    /// Default topic (publish target or subscription filter)
    pub topic: String,

    /// Optional username/password pair, passed through as-is
    pub credentials: Option<(String, String)>,

    /// Client id; generated when absent
    pub client_id: Option<String>,

    /// Quality of service level (0, 1 or 2)
    pub qos: u8,

    /// MQTT keep-alive interval
    pub keep_alive: Duration,

    /// Capacity of the client request queue
    pub request_capacity: usize,

    /// Timeouts (MQTT never reconnects on its own)
    pub options: EndpointOptions,
}

impl MqttConfig {
    /// Create a config for `broker` on the default port
    pub fn new(broker: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: DEFAULT_MQTT_PORT,
            topic: topic.into(),
            credentials: None,
            client_id: None,
            qos: 0,
            keep_alive: Duration::from_secs(60),
            request_capacity: 100,
            options: EndpointOptions::default(),
        }
    }

    /// Set broker port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set username and password
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Set a fixed client id
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Set QoS (capped at 2)
    pub fn qos(mut self, qos: u8) -> Self {
        self.qos = qos.min(2);
        self
    }

    /// Set keep-alive interval
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Set handshake timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Set send timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.options.send_timeout = timeout;
        self
    }

    /// Endpoint label, `mqtt://broker:port/topic`
    pub fn endpoint(&self) -> String {
        format!("mqtt://{}:{}/{}", self.broker, self.port, self.topic)
    }

    /// Check broker and topic shape
    pub fn validate(&self) -> Result<()> {
        if self.broker.trim().is_empty() {
            return Err(Error::InvalidValue("MQTT broker address is empty".into()));
        }
        validate_topic(&self.topic)
    }
}

/// Check that a URL uses the `ws://` or `wss://` scheme and names a host
pub fn validate_ws_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .ok_or_else(|| Error::InvalidValue(format!("`{}` is not a ws:// or wss:// URL", url)))?;

    if rest.is_empty() || rest.starts_with('/') {
        return Err(Error::InvalidValue(format!("`{}` has no host", url)));
    }
    Ok(())
}

/// Check a slash-separated topic name.
///
/// Topics must be non-empty, contain no NUL, and not start or end with `/`.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidValue("topic is empty".into()));
    }
    if topic.contains('\0') {
        return Err(Error::InvalidValue("topic contains NUL".into()));
    }
    if topic.starts_with('/') || topic.ends_with('/') {
        return Err(Error::InvalidValue(format!(
            "topic `{}` must not start or end with '/'",
            topic
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_uncapped_backoff_saturates() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::MAX).multiplier(1e30);

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::MAX);
        assert_eq!(policy.delay_for(u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_backoff_multiplier_clamped() {
        let policy = ReconnectPolicy::default().multiplier(0.5);
        assert_eq!(policy.multiplier, 1.0);
        assert_eq!(policy.delay_for(10), policy.initial_delay);

        let policy = ReconnectPolicy::default().multiplier(f64::NAN);
        assert_eq!(policy.multiplier, 1.0);
    }

    #[test]
    fn test_ws_config_defaults() {
        let config = WsConfig::new("ws://localhost:8765");

        assert!(config.options.reconnect.is_some());
        assert_eq!(config.options.connect_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());

        let config = config.no_reconnect().header("Authorization", "Bearer abc");
        assert!(config.options.reconnect.is_none());
        assert_eq!(config.headers.len(), 1);
    }

    #[test]
    fn test_mqtt_config_builder() {
        let config = MqttConfig::new("broker.local", "sensors/temperature")
            .port(8883)
            .credentials("user", "secret")
            .qos(7)
            .client_id("pub-1");

        assert_eq!(config.port, 8883);
        assert_eq!(config.qos, 2);
        assert_eq!(config.client_id.as_deref(), Some("pub-1"));
        assert!(config.options.reconnect.is_none());
        assert_eq!(config.endpoint(), "mqtt://broker.local:8883/sensors/temperature");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ws_url() {
        assert!(validate_ws_url("ws://127.0.0.1:9000/feed").is_ok());
        assert!(validate_ws_url("wss://example.com").is_ok());
        assert!(validate_ws_url("http://example.com").is_err());
        assert!(validate_ws_url("ws://").is_err());
        assert!(validate_ws_url("ws:///path").is_err());
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("home/livingroom/temperature").is_ok());
        assert!(validate_topic("sensors/#").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("/leading").is_err());
        assert!(validate_topic("trailing/").is_err());
        assert!(validate_topic("nul\0byte").is_err());
        assert!(MqttConfig::new(" ", "a/b").validate().is_err());
    }
}
