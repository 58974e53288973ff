//! Named endpoint table
//!
//! Maps names to the bridge's publishers and subscribers. The lock covers the
//! maps only; callers get `Arc` clones and do their network I/O unlocked.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::client::ListenHandle;

use super::endpoint::{BridgePublisher, BridgeSubscriber, EndpointStatus};
use super::relay::SubscriberRelay;

pub(crate) type RelaySubscriber = BridgeSubscriber<SubscriberRelay>;

pub(crate) struct SubscriberEntry {
    pub(crate) subscriber: Arc<RelaySubscriber>,
    pub(crate) listener: Option<ListenHandle>,
}

#[derive(Default)]
pub(crate) struct EndpointTable {
    publishers: RwLock<BTreeMap<String, Arc<BridgePublisher>>>,
    subscribers: RwLock<BTreeMap<String, SubscriberEntry>>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a publisher, returning the one it replaced
    pub(crate) async fn insert_publisher(
        &self,
        name: String,
        publisher: Arc<BridgePublisher>,
    ) -> Option<Arc<BridgePublisher>> {
        self.publishers.write().await.insert(name, publisher)
    }

    pub(crate) async fn remove_publisher(&self, name: &str) -> Option<Arc<BridgePublisher>> {
        self.publishers.write().await.remove(name)
    }

    /// Snapshot of all publishers, ordered by name
    pub(crate) async fn publishers(&self) -> Vec<(String, Arc<BridgePublisher>)> {
        self.publishers
            .read()
            .await
            .iter()
            .map(|(name, p)| (name.clone(), Arc::clone(p)))
            .collect()
    }

    /// Insert a subscriber, returning the entry it replaced
    pub(crate) async fn insert_subscriber(&self, name: String, entry: SubscriberEntry) -> Option<SubscriberEntry> {
        self.subscribers.write().await.insert(name, entry)
    }

    pub(crate) async fn remove_subscriber(&self, name: &str) -> Option<SubscriberEntry> {
        self.subscribers.write().await.remove(name)
    }

    /// Remove and return every endpoint
    pub(crate) async fn drain(&self) -> (Vec<Arc<BridgePublisher>>, Vec<SubscriberEntry>) {
        let publishers = std::mem::take(&mut *self.publishers.write().await);
        let subscribers = std::mem::take(&mut *self.subscribers.write().await);

        (
            publishers.into_values().collect(),
            subscribers.into_values().collect(),
        )
    }

    pub async fn publisher_status(&self) -> BTreeMap<String, EndpointStatus> {
        self.publishers
            .read()
            .await
            .iter()
            .map(|(name, p)| (name.clone(), p.status()))
            .collect()
    }

    pub async fn subscriber_status(&self) -> BTreeMap<String, EndpointStatus> {
        self.subscribers
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.subscriber.status()))
            .collect()
    }

    pub async fn publisher_names(&self) -> Vec<String> {
        self.publishers.read().await.keys().cloned().collect()
    }

    pub async fn subscriber_names(&self) -> Vec<String> {
        self.subscribers.read().await.keys().cloned().collect()
    }
}
