//! Record publisher
//!
//! High-level API for sending records over one outbound transport.
//!
//! When the endpoint carries a [`ReconnectPolicy`], a monitor task is started
//! on the first `connect()`. Any handshake or write failure wakes the monitor,
//! which retries with capped exponential backoff until it succeeds or
//! `disconnect()` is called. Without a policy, failures are returned to the
//! caller and nothing retries.
//!
//! [`ReconnectPolicy`]: super::config::ReconnectPolicy

use std::sync::Arc;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::session::{ConnectionState, StateCell};

use super::config::{EndpointOptions, MqttConfig, WsConfig};
use super::mqtt::MqttOutbound;
use super::transport::{establish, send_with_timeout, stop_requested, OutboundTransport};
use super::websocket::WsTransport;

/// One failed record in a batch
#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the record in the input slice
    pub index: usize,
    /// Why it was not sent
    pub cause: Error,
}

/// Outcome of [`Publisher::publish_batch`]
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Number of records written
    pub sent: usize,
    /// Records that were not written, in input order
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    /// Check if every record was written
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total records attempted
    pub fn attempted(&self) -> usize {
        self.sent + self.failures.len()
    }
}

/// Outbound endpoint bound to a single transport
///
/// # Example
/// ```no_run
/// use iotkit_rs::client::{Publisher, WsConfig};
/// use iotkit_rs::Record;
///
/// # async fn example() -> iotkit_rs::Result<()> {
/// let publisher = Publisher::websocket(WsConfig::new("ws://localhost:8765"));
/// publisher.connect().await?;
///
/// let record = Record::stamped().with("temperature", 21.4);
/// publisher.publish(&record, None).await?;
///
/// publisher.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct Publisher<T: OutboundTransport> {
    inner: Arc<PublisherInner<T>>,
}

struct PublisherInner<T> {
    transport: Mutex<T>,
    state: StateCell,
    endpoint: String,
    default_destination: String,
    options: EndpointOptions,
    reconnect_trigger: Notify,
    shutdown: watch::Sender<bool>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Publisher<WsTransport> {
    /// Create a WebSocket publisher
    pub fn websocket(config: WsConfig) -> Self {
        Self::new(WsTransport::new(config))
    }
}

impl Publisher<MqttOutbound> {
    /// Create an MQTT publisher
    pub fn mqtt(config: MqttConfig) -> Self {
        Self::new(MqttOutbound::new(config))
    }
}

impl<T: OutboundTransport> Publisher<T> {
    /// Create a publisher around an unconnected transport
    pub fn new(transport: T) -> Self {
        let endpoint = transport.endpoint().to_string();
        let default_destination = transport.default_destination().to_string();
        let options = transport.options().clone();
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(PublisherInner {
                transport: Mutex::new(transport),
                state: StateCell::new(endpoint.clone()),
                endpoint,
                default_destination,
                options,
                reconnect_trigger: Notify::new(),
                shutdown,
                monitor: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Connect to the endpoint.
    ///
    /// Returns `Error::Connection` if the handshake fails or times out. With a
    /// reconnect policy the monitor keeps retrying in the background after
    /// that error.
    pub async fn connect(&self) -> Result<()> {
        self.inner.shutdown.send_replace(false);

        let result = self.inner.handshake().await;

        if self.inner.options.reconnect.is_some() {
            self.ensure_monitor();
            if result.is_err() {
                self.inner.reconnect_trigger.notify_one();
            }
        }

        result
    }

    /// Publish a single record.
    ///
    /// `destination` overrides the endpoint's default topic or channel.
    pub async fn publish(&self, record: &Record, destination: Option<&str>) -> Result<()> {
        if !self.inner.state.get().is_connected() {
            return Err(Error::NotConnected(self.inner.endpoint.clone()));
        }

        let payload = record.to_payload()?;
        let destination = destination.unwrap_or(&self.inner.default_destination);

        let result = {
            let mut transport = self.inner.transport.lock().await;
            send_with_timeout(
                &mut *transport,
                destination,
                payload,
                self.inner.options.send_timeout,
            )
            .await
        };

        match result {
            Ok(()) => {
                tracing::debug!(endpoint = %self.inner.endpoint, destination = %destination, "Record published");
                Ok(())
            }
            Err(e) if e.is_link_failure() => {
                self.inner.link_lost(&e);
                Err(match e {
                    Error::Publish { .. } => e,
                    other => Error::publish(destination, other),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Publish records in order.
    ///
    /// Every record is attempted; failures are reported by index.
    pub async fn publish_batch(&self, records: &[Record]) -> BatchReport {
        let mut report = BatchReport::default();

        for (index, record) in records.iter().enumerate() {
            match self.publish(record, None).await {
                Ok(()) => report.sent += 1,
                Err(cause) => report.failures.push(BatchFailure { index, cause }),
            }
        }

        if !report.is_complete() {
            tracing::warn!(
                endpoint = %self.inner.endpoint,
                sent = report.sent,
                failed = report.failures.len(),
                "Batch partially published"
            );
        }

        report
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Safe to call repeatedly and when never connected.
    pub async fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }

        let prev = self.inner.state.begin_close();

        self.inner.transport.lock().await.close().await;
        self.inner.state.mark_disconnected();

        if prev != ConnectionState::Disconnected {
            tracing::info!(endpoint = %self.inner.endpoint, "Publisher disconnected");
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Subscribe to connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.watch()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.inner.state.get().is_connected()
    }

    /// Endpoint label
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    fn ensure_monitor(&self) {
        let mut monitor = self.inner.monitor.lock();
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *monitor = Some(tokio::spawn(async move { inner.reconnect_loop().await }));
    }
}

impl<T: OutboundTransport> PublisherInner<T> {
    async fn handshake(&self) -> Result<()> {
        let mut transport = self.transport.lock().await;
        let result = establish(&mut *transport, &self.state).await;

        match &result {
            Ok(()) => tracing::info!(endpoint = %self.endpoint, "Publisher connected"),
            Err(e) => tracing::warn!(endpoint = %self.endpoint, error = %e, "Publisher connect failed"),
        }

        result
    }

    fn link_lost(&self, cause: &Error) {
        self.state.mark_disconnected();
        tracing::warn!(endpoint = %self.endpoint, error = %cause, "Publisher link lost");

        if self.options.reconnect.is_some() {
            self.reconnect_trigger.notify_one();
        }
    }

    /// Wait for failure notifications and reconnect until shut down
    async fn reconnect_loop(&self) {
        let Some(policy) = self.options.reconnect.clone() else {
            return;
        };
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = self.reconnect_trigger.notified() => {}
                _ = stop_requested(&mut shutdown) => return,
            }

            let mut attempt: u32 = 0;
            while !self.state.get().is_connected() {
                let delay = policy.delay_for(attempt);
                tracing::info!(
                    endpoint = %self.endpoint,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_requested(&mut shutdown) => return,
                }

                if self.handshake().await.is_ok() {
                    tracing::info!(endpoint = %self.endpoint, attempts = attempt + 1, "Publisher reconnected");
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

impl<T: OutboundTransport> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::config::ReconnectPolicy;
    use crate::client::transport::Transport;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory transport with switchable failures
    #[derive(Clone)]
    struct MockTransport {
        options: EndpointOptions,
        connected: Arc<AtomicBool>,
        refuse_connects: Arc<AtomicUsize>,
        fail_sends: Arc<AtomicBool>,
        sent: Arc<parking_lot::Mutex<Vec<(String, Bytes)>>>,
    }

    impl MockTransport {
        fn new(reconnect: Option<ReconnectPolicy>) -> Self {
            Self {
                options: EndpointOptions {
                    reconnect,
                    ..Default::default()
                },
                connected: Arc::new(AtomicBool::new(false)),
                refuse_connects: Arc::new(AtomicUsize::new(0)),
                fail_sends: Arc::new(AtomicBool::new(false)),
                sent: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }
        }
    }

    impl Transport for MockTransport {
        fn endpoint(&self) -> &str {
            "mock://sensors"
        }

        fn options(&self) -> &EndpointOptions {
            &self.options
        }

        fn default_destination(&self) -> &str {
            "sensors/default"
        }

        async fn connect(&mut self) -> Result<()> {
            let refused = self
                .refuse_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(Error::connection("mock://sensors", "refused"));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    impl OutboundTransport for MockTransport {
        async fn send(&mut self, destination: &str, payload: Bytes) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::publish(destination, "broken pipe"));
            }
            self.sent.lock().push((destination.to_string(), payload));
            Ok(())
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(40))
    }

    async fn wait_for_state(publisher: &Publisher<MockTransport>, target: ConnectionState) {
        let mut rx = publisher.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let publisher = Publisher::new(MockTransport::new(None));
        let result = publisher.publish(&Record::stamped(), None).await;

        assert!(matches!(result, Err(Error::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_publish_default_and_override_destination() {
        let transport = MockTransport::new(None);
        let sent = Arc::clone(&transport.sent);
        let publisher = Publisher::new(transport);

        publisher.connect().await.unwrap();
        assert!(publisher.is_connected());

        let record = Record::stamped().with("value", 3);
        publisher.publish(&record, None).await.unwrap();
        publisher.publish(&record, Some("sensors/override")).await.unwrap();

        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "sensors/default");
        assert_eq!(sent[1].0, "sensors/override");
    }

    #[tokio::test]
    async fn test_batch_reports_failures_by_index() {
        let publisher = Publisher::new(MockTransport::new(None));
        publisher.connect().await.unwrap();

        let records = vec![
            Record::stamped().with("n", 0),
            Record::new().with("n", 1),
            Record::stamped().with("n", 2),
        ];
        let report = publisher.publish_batch(&records).await;

        assert_eq!(report.sent, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert!(matches!(report.failures[0].cause, Error::InvalidRecord(_)));
        assert_eq!(report.attempted(), 3);
    }

    #[tokio::test]
    async fn test_double_disconnect() {
        let publisher = Publisher::new(MockTransport::new(None));

        // Never connected
        publisher.disconnect().await;
        assert_eq!(publisher.state(), ConnectionState::Disconnected);

        publisher.connect().await.unwrap();
        publisher.disconnect().await;
        publisher.disconnect().await;
        assert_eq!(publisher.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_without_policy() {
        let transport = MockTransport::new(None);
        transport.refuse_connects.store(1, Ordering::SeqCst);
        let publisher = Publisher::new(transport);

        assert!(matches!(
            publisher.connect().await,
            Err(Error::Connection { .. })
        ));
        assert_eq!(publisher.state(), ConnectionState::Disconnected);

        // Nothing retries in the background
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(publisher.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_after_refused_connect() {
        let transport = MockTransport::new(Some(fast_policy()));
        transport.refuse_connects.store(3, Ordering::SeqCst);
        let publisher = Publisher::new(transport);

        assert!(publisher.connect().await.is_err());
        wait_for_state(&publisher, ConnectionState::Connected).await;

        publisher.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_failure_triggers_reconnect() {
        let transport = MockTransport::new(Some(fast_policy()));
        let fail_sends = Arc::clone(&transport.fail_sends);
        let publisher = Publisher::new(transport);
        publisher.connect().await.unwrap();

        fail_sends.store(true, Ordering::SeqCst);
        let result = publisher.publish(&Record::stamped(), None).await;
        assert!(matches!(result, Err(Error::Publish { .. })));

        fail_sends.store(false, Ordering::SeqCst);
        wait_for_state(&publisher, ConnectionState::Connected).await;
        publisher.publish(&Record::stamped(), None).await.unwrap();

        publisher.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_stops_reconnect_loop() {
        let transport = MockTransport::new(Some(fast_policy()));
        transport.refuse_connects.store(usize::MAX, Ordering::SeqCst);
        let publisher = Publisher::new(transport);

        assert!(publisher.connect().await.is_err());
        publisher.disconnect().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(publisher.state(), ConnectionState::Disconnected);
    }
}
