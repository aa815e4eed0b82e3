//! Message types for RouteQ
//!
//! Defines the inbound delivery handed to the engine, the acknowledger
//! capability attached to it, and the metadata a transport returns on
//! publish.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::Result;

/// String-keyed header map carried by every message
pub type Headers = HashMap<String, String>;

/// Unique identifier for a message (broker-native or generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirm the delivery was processed
    async fn ack(&self) -> Result<()>;

    /// Reject the delivery so the broker can redeliver it
    async fn nack(&self) -> Result<()>;
}

/// Acknowledger for transports without settlement
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAcknowledger;

#[async_trait]
impl Acknowledger for NoopAcknowledger {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        Ok(())
    }
}

/// A message delivered by a broker transport
///
/// Created once per delivery and consumed exactly once by the engine.
#[derive(Clone)]
pub struct InboundMessage {
    /// Broker-native (or derived) message identifier
    pub id: MessageId,

    /// Concrete topic / destination the message arrived on
    pub topic: String,

    /// Opaque payload
    pub body: Bytes,

    /// Transport headers / attributes
    pub headers: Headers,

    /// Number of delivery attempts, starting at 1
    pub delivery_count: u32,

    /// When the transport handed the message over
    pub received_at: DateTime<Utc>,

    acker: Arc<dyn Acknowledger>,
}

impl InboundMessage {
    /// Create a new inbound message with a no-op acknowledger
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            topic: topic.into(),
            body: body.into(),
            headers: Headers::new(),
            delivery_count: 1,
            received_at: Utc::now(),
            acker: Arc::new(NoopAcknowledger),
        }
    }

    /// Set the message id
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Replace all headers
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Set the delivery attempt counter
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    /// Attach the acknowledger that settles this delivery
    pub fn with_acknowledger(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = acker;
        self
    }

    /// Acknowledger handle for this delivery
    pub fn acknowledger(&self) -> Arc<dyn Acknowledger> {
        Arc::clone(&self.acker)
    }

    /// Header lookup
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Non-empty event identifier stored under `header`
    pub fn event_id(&self, header: &str) -> Option<&str> {
        self.header(header).filter(|id| !id.is_empty())
    }

    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Serializable view without the acknowledger
    pub fn snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            id: self.id.clone(),
            topic: self.topic.clone(),
            body: self.body.clone(),
            headers: self.headers.clone(),
            delivery_count: self.delivery_count,
            received_at: self.received_at,
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Serializable copy of a delivered message
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageSnapshot {
    pub id: MessageId,

    pub topic: String,

    /// Message body: UTF-8 text, or `{"base64": "..."}` for binary payloads
    #[serde(with = "bytes_serde")]
    #[schema(value_type = Object)]
    pub body: Bytes,

    #[serde(default)]
    pub headers: Headers,

    pub delivery_count: u32,

    pub received_at: DateTime<Utc>,
}

/// Broker-assigned metadata returned by a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PublishReceipt {
    /// Message id assigned by the broker
    pub message_id: MessageId,

    /// Broker sequence number, when the broker has one
    pub sequence: Option<u64>,
}

/// Custom serialization for Bytes
///
/// UTF-8 bodies are written as a plain string, anything else as
/// `{"base64": "..."}`; both forms are accepted on read.
mod bytes_serde {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Wire<'a> {
        Text(std::borrow::Cow<'a, str>),
        Binary { base64: String },
    }

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match std::str::from_utf8(bytes) {
            Ok(text) => Wire::Text(text.into()).serialize(serializer),
            Err(_) => Wire::Binary {
                base64: base64::engine::general_purpose::STANDARD.encode(bytes),
            }
            .serialize(serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Wire::deserialize(deserializer)? {
            Wire::Text(text) => Ok(Bytes::from(text.into_owned())),
            Wire::Binary { base64 } => base64::engine::general_purpose::STANDARD
                .decode(base64)
                .map(Bytes::from)
                .map_err(de::Error::custom),
        }
    }
}
