//! Record subscriber
//!
//! Reads records from one inbound transport and hands each to a
//! [`MessageHandler`], either on the calling task ([`Subscriber::start_listening`])
//! or on a spawned one ([`Subscriber::start_listening_async`]).
//!
//! The listen loop owns the transport for as long as it runs. `stop()` raises
//! a watch flag, then takes the transport back once the loop has let go.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::session::{ConnectionState, StateCell};

use super::config::{EndpointOptions, MqttConfig, WsConfig};
use super::handler::{run_guarded, MessageHandler};
use super::mqtt::MqttInbound;
use super::transport::{establish, stop_requested, Inbound, InboundTransport};
use super::websocket::WsTransport;

/// Counters kept by the listen loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenStats {
    /// Messages read from the transport
    pub messages_received: u64,
    /// Payloads that were not a JSON object
    pub malformed: u64,
    /// Handler calls that returned an error or panicked
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    malformed: AtomicU64,
    handler_failures: AtomicU64,
}

/// Handle to a background listen loop
#[derive(Debug)]
pub struct ListenHandle {
    handle: JoinHandle<()>,
}

impl ListenHandle {
    /// Check if the loop has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!(error = %e, "Listen loop panicked");
            }
        }
    }

    /// Cancel the loop without closing the connection
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Inbound endpoint bound to a single transport and handler
pub struct Subscriber<T: InboundTransport, H: MessageHandler> {
    inner: Arc<SubscriberInner<T, H>>,
}

struct SubscriberInner<T, H> {
    transport: Mutex<T>,
    handler: H,
    state: StateCell,
    endpoint: String,
    options: EndpointOptions,
    stop_tx: watch::Sender<bool>,
    listening: AtomicBool,
    counters: Counters,
}

impl<H: MessageHandler> Subscriber<WsTransport, H> {
    /// Create a WebSocket subscriber
    pub fn websocket(config: WsConfig, handler: H) -> Self {
        Self::new(WsTransport::new(config), handler)
    }
}

impl<H: MessageHandler> Subscriber<MqttInbound, H> {
    /// Create an MQTT subscriber for the configured topic filter
    pub fn mqtt(config: MqttConfig, handler: H) -> Self {
        Self::new(MqttInbound::new(config), handler)
    }
}

impl<T: InboundTransport, H: MessageHandler> Subscriber<T, H> {
    /// Create a subscriber around an unconnected transport
    pub fn new(transport: T, handler: H) -> Self {
        let endpoint = transport.endpoint().to_string();
        let options = transport.options().clone();
        let (stop_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(SubscriberInner {
                transport: Mutex::new(transport),
                handler,
                state: StateCell::new(endpoint.clone()),
                endpoint,
                options,
                stop_tx,
                listening: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Connect to the endpoint
    pub async fn connect(&self) -> Result<()> {
        let mut transport = self.inner.transport.lock().await;
        let result = establish(&mut *transport, &self.inner.state).await;

        match &result {
            Ok(()) => tracing::info!(endpoint = %self.inner.endpoint, "Subscriber connected"),
            Err(e) => tracing::warn!(endpoint = %self.inner.endpoint, error = %e, "Subscriber connect failed"),
        }

        result
    }

    /// Run the listen loop on the current task until stopped.
    ///
    /// Without a reconnect policy the loop also ends when the connection
    /// drops. Requires a prior successful `connect()` unless the endpoint
    /// reconnects on its own.
    pub async fn start_listening(&self) -> Result<()> {
        self.begin_listening()?;
        self.inner.listen().await;
        Ok(())
    }

    /// Spawn the listen loop and return immediately
    pub fn start_listening_async(&self) -> Result<ListenHandle> {
        self.begin_listening()?;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.listen().await });
        Ok(ListenHandle { handle })
    }

    /// Stop listening and disconnect.
    ///
    /// Waits for the loop to finish the message it is delivering.
    pub async fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
        let prev = self.inner.state.begin_close();

        self.inner.transport.lock().await.close().await;
        self.inner.state.mark_disconnected();

        if prev != ConnectionState::Disconnected {
            tracing::info!(endpoint = %self.inner.endpoint, "Subscriber stopped");
        }
    }

    /// Alias for [`stop`](Self::stop)
    pub async fn disconnect(&self) {
        self.stop().await
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

    /// Check if a listen loop is running
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// Endpoint label
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Get the handler
    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    /// Snapshot of the listen loop counters
    pub fn stats(&self) -> ListenStats {
        let c = &self.inner.counters;
        ListenStats {
            messages_received: c.messages_received.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn begin_listening(&self) -> Result<()> {
        if !self.is_connected() && self.inner.options.reconnect.is_none() {
            return Err(Error::NotConnected(self.inner.endpoint.clone()));
        }
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyListening(self.inner.endpoint.clone()));
        }

        self.inner.stop_tx.send_replace(false);
        Ok(())
    }
}

impl<T: InboundTransport, H: MessageHandler> SubscriberInner<T, H> {
    async fn listen(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut transport = self.transport.lock().await;
        let mut attempt: u32 = 0;

        tracing::info!(endpoint = %self.endpoint, "Listen loop started");

        while !*stop_rx.borrow_and_update() {
            if !self.state.get().is_connected() {
                let Some(policy) = self.options.reconnect.as_ref() else {
                    tracing::info!(endpoint = %self.endpoint, "Connection gone, listen loop exiting");
                    break;
                };

                let delay = policy.delay_for(attempt);
                tracing::info!(
                    endpoint = %self.endpoint,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_requested(&mut stop_rx) => break,
                }

                attempt = attempt.saturating_add(1);
                match establish(&mut *transport, &self.state).await {
                    Ok(()) => {
                        tracing::info!(endpoint = %self.endpoint, attempts = attempt, "Subscriber reconnected");
                        attempt = 0;
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %self.endpoint, error = %e, "Reconnect failed");
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = stop_requested(&mut stop_rx) => break,
                result = transport.recv() => match result {
                    Ok(Some(message)) => self.deliver(message).await,
                    Ok(None) => {
                        tracing::info!(endpoint = %self.endpoint, "Connection closed by peer");
                        self.state.mark_disconnected();
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %self.endpoint, error = %e, "Receive failed");
                        self.state.mark_disconnected();
                    }
                },
            }
        }

        drop(transport);
        self.listening.store(false, Ordering::SeqCst);
        tracing::info!(endpoint = %self.endpoint, "Listen loop stopped");
    }

    async fn deliver(&self, message: Inbound) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        let record = match Record::from_slice(&message.payload) {
            Ok(record) => record,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    endpoint = %self.endpoint,
                    source = %message.source,
                    error = %e,
                    "Skipping malformed payload"
                );
                return;
            }
        };

        tracing::debug!(endpoint = %self.endpoint, source = %message.source, "Record received");

        if let Err(reason) = run_guarded(self.handler.on_message(&message.source, record)).await {
            self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                endpoint = %self.endpoint,
                source = %message.source,
                error = %reason,
                "Message handler failed"
            );
        }
    }
}

impl<T: InboundTransport, H: MessageHandler> Drop for Subscriber<T, H> {
    fn drop(&mut self) {
        self.inner.stop_tx.send_replace(true);
    }
}
