//! Broker abstraction and the in-memory implementation.
//!
//! A broker carries hook payloads between process instances. Each hook maps
//! to one *channel*; each channel fans out to its *consumer groups*, and
//! within a group at most one consumer receives a given message. Work-queue
//! subscriptions share a group; broadcast subscriptions each get a unique
//! group, so every one of them sees every message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::EventError;

/// A single message handed to a consumer group.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
}

/// Transport seam for hook delivery between process instances.
///
/// The production transport is an external collaborator; the bus only relies
/// on the semantics below:
///
/// - `publish` returns once the message is accepted for every existing group
///   of the channel, in enqueue order per group;
/// - `subscribe` lazily creates the channel and the group queue;
/// - `release_group` drops a group queue, and dropping the last group of a
///   channel releases the channel itself;
/// - `shutdown` closes everything; later publishes fail.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), EventError>;

    async fn subscribe(
        &self,
        channel: &str,
        group: &str,
    ) -> Result<mpsc::Receiver<Delivery>, EventError>;

    async fn release_group(&self, channel: &str, group: &str);

    async fn shutdown(&self);
}

/// Per-group queue capacity. Publishing blocks once a group lags this far
/// behind, which bounds memory instead of growing without limit.
const GROUP_QUEUE_CAPACITY: usize = 256;

type GroupMap = HashMap<String, mpsc::Sender<Delivery>>;

/// In-process broker: a map of channel -> consumer-group queues.
///
/// Used for single-instance deployments and tests. Ordering within a group
/// follows `mpsc` FIFO semantics, matching the per-queue ordering guarantee
/// of the networked transports.
pub struct InMemoryBroker {
    channels: Mutex<HashMap<String, GroupMap>>,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of live consumer groups on a channel. Test hook.
    pub async fn group_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().await;
        channels.get(channel).map(|g| g.len()).unwrap_or(0)
    }

    /// Whether a channel currently exists. Test hook.
    pub async fn has_channel(&self, channel: &str) -> bool {
        self.channels.lock().await.contains_key(channel)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), EventError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventError::BrokerUnavailable("broker closed".into()));
        }

        // Snapshot the group senders so slow consumers don't hold the lock.
        let senders: Vec<(String, mpsc::Sender<Delivery>)> = {
            let channels = self.channels.lock().await;
            match channels.get(channel) {
                Some(groups) => groups
                    .iter()
                    .map(|(g, s)| (g.clone(), s.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut dead = Vec::new();
        for (group, sender) in &senders {
            let delivery = Delivery {
                payload: payload.clone(),
            };
            if sender.send(delivery).await.is_err() {
                dead.push(group.clone());
            }
        }

        if !dead.is_empty() {
            let mut channels = self.channels.lock().await;
            if let Some(groups) = channels.get_mut(channel) {
                for group in dead {
                    groups.remove(&group);
                }
                if groups.is_empty() {
                    channels.remove(channel);
                }
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        group: &str,
    ) -> Result<mpsc::Receiver<Delivery>, EventError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventError::BrokerUnavailable("broker closed".into()));
        }

        let (tx, rx) = mpsc::channel(GROUP_QUEUE_CAPACITY);
        let mut channels = self.channels.lock().await;
        let groups = channels.entry(channel.to_string()).or_default();
        if groups.contains_key(group) {
            return Err(EventError::InvalidConfig(format!(
                "consumer group '{group}' already exists on channel '{channel}'"
            )));
        }
        groups.insert(group.to_string(), tx);
        Ok(rx)
    }

    async fn release_group(&self, channel: &str, group: &str) {
        let mut channels = self.channels.lock().await;
        if let Some(groups) = channels.get_mut(channel) {
            groups.remove(group);
            if groups.is_empty() {
                channels.remove(channel);
            }
        }
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_delivery_per_group() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe("hook", "g1").await.unwrap();
        let mut b = broker.subscribe("hook", "g2").await.unwrap();

        broker.publish("hook", b"x".to_vec()).await.unwrap();

        assert_eq!(a.recv().await.unwrap().payload, b"x");
        assert_eq!(b.recv().await.unwrap().payload, b"x");
    }

    #[tokio::test]
    async fn duplicate_group_rejected() {
        let broker = InMemoryBroker::new();
        let _rx = broker.subscribe("hook", "g1").await.unwrap();
        let err = broker.subscribe("hook", "g1").await.unwrap_err();
        assert!(matches!(err, EventError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn releasing_last_group_drops_channel() {
        let broker = InMemoryBroker::new();
        let _rx = broker.subscribe("hook", "g1").await.unwrap();
        assert!(broker.has_channel("hook").await);

        broker.release_group("hook", "g1").await;
        assert!(!broker.has_channel("hook").await);
    }

    #[tokio::test]
    async fn publish_after_shutdown_fails() {
        let broker = InMemoryBroker::new();
        broker.shutdown().await;
        let err = broker.publish("hook", vec![]).await.unwrap_err();
        assert!(matches!(err, EventError::BrokerUnavailable(_)));
    }

    #[tokio::test]
    async fn fifo_within_group() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.subscribe("hook", "g").await.unwrap();
        for i in 0u8..5 {
            broker.publish("hook", vec![i]).await.unwrap();
        }
        for i in 0u8..5 {
            assert_eq!(rx.recv().await.unwrap().payload, vec![i]);
        }
    }
}
