//! In-memory transport
//!
//! Fast, non-persistent pub/sub broker for development and testing.
//! Every subscription whose filter matches a published topic receives its
//! own delivery, tracked in-flight until it is acked or nacked.
//! Messages published with `retain` are kept per topic and delivered to
//! later subscriptions whose filter matches.
//! All data is lost when the process exits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use routeq_types::{
    Acknowledger, Error, Headers, InboundMessage, MessageId, PublishReceipt, Result,
    TransportStats,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::filter;
use crate::traits::{PublishOptions, SubscribeOptions, Subscription, Transport};

/// Broker kind reported by [`MemoryTransport`]
pub const MEMORY_BROKER: &str = "memory-broker";

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_MAX_REDELIVERIES: u32 = 5;

type DeliveryKey = (u64, MessageId);

/// An active subscription
struct Subscriber {
    filter: String,
    tx: mpsc::Sender<InboundMessage>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    failed: AtomicU64,
}

/// Last retained message for a topic
struct Retained {
    body: Bytes,
    headers: Headers,
}

/// State shared between the transport and the acknowledgers it hands out
struct Shared {
    /// Subscriptions stored by id
    subscribers: DashMap<u64, Subscriber>,
    /// Deliveries handed out but not yet settled
    in_flight: DashMap<DeliveryKey, InboundMessage>,
    /// Retained messages keyed by topic
    retained: DashMap<String, Retained>,
    counters: Counters,
    max_redeliveries: u32,
}

impl Shared {
    fn track(self: &Arc<Self>, subscription: u64, message: InboundMessage) -> InboundMessage {
        let key = (subscription, message.id.clone());
        let message = message.with_acknowledger(Arc::new(MemoryAcker {
            shared: Arc::clone(self),
            key: key.clone(),
        }));
        self.in_flight.insert(key, message.clone());
        message
    }
}

/// Settles one delivery of a [`MemoryTransport`]
struct MemoryAcker {
    shared: Arc<Shared>,
    key: DeliveryKey,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        match self.shared.in_flight.remove(&self.key) {
            Some(_) => {
                self.shared.counters.acked.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %self.key.1, "Message acknowledged");
                Ok(())
            }
            None => Err(Error::MessageNotFound(self.key.1.to_string())),
        }
    }

    async fn nack(&self) -> Result<()> {
        let (_, message) = self
            .shared
            .in_flight
            .remove(&self.key)
            .ok_or_else(|| Error::MessageNotFound(self.key.1.to_string()))?;
        self.shared.counters.nacked.fetch_add(1, Ordering::Relaxed);

        if message.delivery_count > self.shared.max_redeliveries {
            self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %message.id,
                delivery_count = message.delivery_count,
                "Message exceeded max redeliveries, dropping"
            );
            return Ok(());
        }

        let tx = match self.shared.subscribers.get(&self.key.0) {
            Some(subscriber) => subscriber.tx.clone(),
            None => {
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Transport(format!(
                    "subscription {} is gone, cannot redeliver {}",
                    self.key.0, message.id
                )));
            }
        };

        let delivery_count = message.delivery_count + 1;
        let redelivery = self
            .shared
            .track(self.key.0, message.with_delivery_count(delivery_count));
        debug!(
            message_id = %redelivery.id,
            delivery_count,
            "Message returned for redelivery"
        );

        // The subscriber may be busy settling this very delivery, so the
        // send must not hold up the caller.
        let shared = Arc::clone(&self.shared);
        let key = self.key.clone();
        tokio::spawn(async move {
            if tx.send(redelivery).await.is_err() {
                shared.in_flight.remove(&key);
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        });
        Ok(())
    }
}

/// In-memory transport implementation
pub struct MemoryTransport {
    kind: String,
    shared: Arc<Shared>,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
    closed: AtomicBool,
    channel_capacity: usize,
}

impl MemoryTransport {
    /// Create a new in-memory transport
    pub fn new() -> Self {
        Self::with_kind(MEMORY_BROKER)
    }

    /// Create a transport reporting a custom broker kind
    pub fn with_kind(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        info!(kind = %kind, "Initializing in-memory transport");
        Self {
            kind,
            shared: Arc::new(Shared {
                subscribers: DashMap::new(),
                in_flight: DashMap::new(),
                retained: DashMap::new(),
                counters: Counters::default(),
                max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            }),
            next_subscription: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set how many times a nacked delivery is redelivered before it is dropped
    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.max_redeliveries = max_redeliveries;
        }
        self
    }

    /// Set the per-subscription buffer size
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of topics holding a retained message
    pub fn retained_count(&self) -> usize {
        self.shared.retained.len()
    }

    /// Current delivery counters
    pub fn stats(&self) -> TransportStats {
        let counters = &self.shared.counters;
        TransportStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            acked: counters.acked.load(Ordering::Relaxed),
            nacked: counters.nacked.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            in_flight: self.shared.in_flight.len() as u64,
            subscriptions: self.shared.subscribers.len() as u64,
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn subscribe(&self, filter: &str, options: &SubscribeOptions) -> Result<Subscription> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        // Collect first; no map guard may be held across an await.
        let retained: Vec<(String, Bytes, Headers)> = self
            .shared
            .retained
            .iter()
            .filter(|r| filter::matches(filter, r.key()))
            .map(|r| (r.key().clone(), r.body.clone(), r.headers.clone()))
            .collect();
        for (topic, body, headers) in retained {
            let message = InboundMessage::new(topic, body).with_headers(headers);
            let message = self.shared.track(id, message);
            if tx.send(message).await.is_ok() {
                self.shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.shared.subscribers.insert(
            id,
            Subscriber {
                filter: filter.to_string(),
                tx,
            },
        );
        info!(filter = %filter, qos = ?options.qos, subscription = id, "Subscription created");

        Ok(Subscription::new(filter, rx))
    }

    async fn publish(
        &self,
        topic: &str,
        body: Bytes,
        headers: Headers,
        options: &PublishOptions,
    ) -> Result<PublishReceipt> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        if options.retain == Some(true) {
            // An empty retained body clears the topic, as in MQTT
            if body.is_empty() {
                self.shared.retained.remove(topic);
            } else {
                self.shared.retained.insert(
                    topic.to_string(),
                    Retained {
                        body: body.clone(),
                        headers: headers.clone(),
                    },
                );
            }
        }

        let message_id = MessageId::new();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);

        // Collect targets first; no map guard may be held across an await.
        let targets: Vec<(u64, mpsc::Sender<InboundMessage>)> = self
            .shared
            .subscribers
            .iter()
            .filter(|s| filter::matches(&s.filter, topic))
            .map(|s| (*s.key(), s.tx.clone()))
            .collect();

        for (subscription, tx) in targets {
            let message = InboundMessage::new(topic, body.clone())
                .with_id(message_id.clone())
                .with_headers(headers.clone());
            let message = self.shared.track(subscription, message);

            if tx.send(message).await.is_err() {
                self.shared.subscribers.remove(&subscription);
                self.shared
                    .in_flight
                    .remove(&(subscription, message_id.clone()));
                debug!(subscription, "Dropped subscription with closed receiver");
                continue;
            }
            self.shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            topic = %topic,
            message_id = %message_id,
            sequence,
            qos = ?options.qos,
            retain = ?options.retain,
            "Message published"
        );

        Ok(PublishReceipt {
            message_id,
            sequence: Some(sequence),
        })
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.subscribers.clear();
            info!(kind = %self.kind, "In-memory transport closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let transport = MemoryTransport::new();
        let mut sub = transport
            .subscribe("orders/+", &SubscribeOptions::default())
            .await
            .unwrap();

        let receipt = transport
            .publish(
                "orders/42",
                Bytes::from("Hello!"),
                headers(&[("k", "v")]),
                &PublishOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.sequence, Some(1));

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.id, receipt.message_id);
        assert_eq!(msg.topic, "orders/42");
        assert_eq!(msg.body_as_str(), Some("Hello!"));
        assert_eq!(msg.header("k"), Some("v"));

        let stats = transport.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.in_flight, 1);
    }

    #[tokio::test]
    async fn test_non_matching_topic_is_not_delivered() {
        let transport = MemoryTransport::new();
        let _sub = transport
            .subscribe("orders/+", &SubscribeOptions::default())
            .await
            .unwrap();

        transport
            .publish(
                "invoices/1",
                Bytes::from("x"),
                Headers::new(),
                &PublishOptions::default(),
            )
            .await
            .unwrap();

        let stats = transport.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_ack_settles_delivery() {
        let transport = MemoryTransport::new();
        let mut sub = transport
            .subscribe("t", &SubscribeOptions::default())
            .await
            .unwrap();
        transport
            .publish(
                "t",
                Bytes::from("x"),
                Headers::new(),
                &PublishOptions::default(),
            )
            .await
            .unwrap();

        let msg = sub.recv().await.unwrap();
        msg.acknowledger().ack().await.unwrap();

        let stats = transport.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.in_flight, 0);

        // Second ack finds nothing to settle
        let err = msg.acknowledger().ack().await.unwrap_err();
        assert!(matches!(err, Error::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_incremented_count() {
        let transport = MemoryTransport::new();
        let mut sub = transport
            .subscribe("t", &SubscribeOptions::default())
            .await
            .unwrap();
        transport
            .publish(
                "t",
                Bytes::from("x"),
                Headers::new(),
                &PublishOptions::default(),
            )
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        first.acknowledger().nack().await.unwrap();

        let second = sub.recv().await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery_count, 2);

        second.acknowledger().ack().await.unwrap();
        let stats = transport.stats();
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_nack_past_limit_drops_delivery() {
        let transport = MemoryTransport::new().with_max_redeliveries(0);
        let mut sub = transport
            .subscribe("t", &SubscribeOptions::default())
            .await
            .unwrap();
        transport
            .publish(
                "t",
                Bytes::from("x"),
                Headers::new(),
                &PublishOptions::default(),
            )
            .await
            .unwrap();

        let msg = sub.recv().await.unwrap();
        msg.acknowledger().nack().await.unwrap();

        let stats = transport.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_rejects_publish() {
        let transport = MemoryTransport::new();
        let mut sub = transport
            .subscribe("t", &SubscribeOptions::default())
            .await
            .unwrap();
        transport
            .publish(
                "t",
                Bytes::from("buffered"),
                Headers::new(),
                &PublishOptions::default(),
            )
            .await
            .unwrap();

        transport.close().await.unwrap();

        // Buffered delivery drains before the source ends
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());

        let err = transport
            .publish(
                "t",
                Bytes::from("late"),
                Headers::new(),
                &PublishOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
        assert_eq!(transport.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_every_matching_subscription() {
        let transport = MemoryTransport::with_kind("mqtt-broker");
        let mut exact = transport
            .subscribe("a/b", &SubscribeOptions::default())
            .await
            .unwrap();
        let mut wildcard = transport
            .subscribe("a/#", &SubscribeOptions { qos: Some(2) })
            .await
            .unwrap();

        transport
            .publish(
                "a/b",
                Bytes::from("x"),
                Headers::new(),
                &PublishOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(exact.recv().await.unwrap().topic, "a/b");
        assert_eq!(wildcard.recv().await.unwrap().topic, "a/b");
        assert_eq!(transport.kind(), "mqtt-broker");
        assert_eq!(transport.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_retained_message_reaches_later_subscriber() {
        let transport = MemoryTransport::new();
        let retain = PublishOptions {
            retain: Some(true),
            ..Default::default()
        };
        transport
            .publish("status/door", Bytes::from("open"), Headers::new(), &retain)
            .await
            .unwrap();
        transport
            .publish(
                "status/light",
                Bytes::from("on"),
                Headers::new(),
                &PublishOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(transport.retained_count(), 1);

        let mut sub = transport
            .subscribe("status/+", &SubscribeOptions::default())
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "status/door");
        assert_eq!(msg.body_as_str(), Some("open"));
        msg.acknowledger().ack().await.unwrap();
        assert_eq!(transport.stats().in_flight, 0);

        // Empty retained body clears the topic
        transport
            .publish("status/door", Bytes::new(), Headers::new(), &retain)
            .await
            .unwrap();
        assert_eq!(transport.retained_count(), 0);
    }
}
