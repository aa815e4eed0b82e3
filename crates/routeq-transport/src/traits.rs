//! Transport trait definition
//!
//! Defines the interface every broker adapter (queue, pub/sub, MQTT,
//! STOMP, ...) exposes to the consumer engine and publisher.

use async_trait::async_trait;
use bytes::Bytes;
use routeq_types::{Headers, InboundMessage, PublishReceipt, Result};
use tokio::sync::mpsc;

/// Per-subscription settings taken from the handler entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Delivery guarantee requested from the broker (MQTT-style QoS)
    pub qos: Option<u8>,
}

/// Per-publish delivery settings
///
/// `None` leaves the choice to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Delivery guarantee requested from the broker (MQTT-style QoS)
    pub qos: Option<u8>,
    /// Keep the message as the topic's last known value for later subscribers
    pub retain: Option<bool>,
}

/// A source of inbound messages for one subscribed filter
///
/// The source ends (`recv` returns `None`) once the transport drops its
/// sending half, e.g. on `close`.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    rx: mpsc::Receiver<InboundMessage>,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            filter: filter.into(),
            rx,
        }
    }

    /// Broker-native filter this source is subscribed to
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait for the next delivery
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

/// Broker transport trait - all adapters implement this
#[async_trait]
pub trait Transport: Send + Sync {
    /// Broker kind, e.g. `"mqtt-broker"`
    fn kind(&self) -> &str;

    /// Subscribe to a broker-native filter (`+` marks a single-level wildcard)
    async fn subscribe(&self, filter: &str, options: &SubscribeOptions) -> Result<Subscription>;

    /// Send a message to a concrete topic
    async fn publish(
        &self,
        topic: &str,
        body: Bytes,
        headers: Headers,
        options: &PublishOptions,
    ) -> Result<PublishReceipt>;

    /// Release the connection; subscription sources end after draining
    async fn close(&self) -> Result<()>;
}
