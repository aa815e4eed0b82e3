//! Publisher
//!
//! Sends messages through the transport with trace context, a content
//! type and an event id attached to the headers.

use std::sync::Arc;

use bytes::Bytes;
use routeq_transport::{PublishOptions, Transport};
use routeq_types::{Headers, PublishReceipt, Result, DEFAULT_EVENT_ID_HEADER};
use tracing::debug;
use uuid::Uuid;

use crate::tracer::{LogTracer, Tracer};

/// Header carrying the body's content type
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Content type used when neither the caller nor the headers name one
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// One outbound message
#[derive(Debug, Clone)]
pub struct PublishArgs {
    pub topic: String,
    pub body: Bytes,
    pub headers: Headers,
    pub content_type: Option<String>,
    /// Partition or ordering key, recorded on the span
    pub key: Option<String>,
    /// Overrides the publisher's default QoS
    pub qos: Option<u8>,
    /// Overrides the publisher's default retain flag
    pub retain: Option<bool>,
}

impl PublishArgs {
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            headers: Headers::new(),
            content_type: None,
            key: None,
            qos: None,
            retain: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = Some(retain);
        self
    }
}

/// Traced publishing front-end over a [`Transport`]
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    tracer: Arc<dyn Tracer>,
    event_id_header: String,
    defaults: PublishOptions,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            tracer: Arc::new(LogTracer),
            event_id_header: DEFAULT_EVENT_ID_HEADER.to_string(),
            defaults: PublishOptions::default(),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_event_id_header(mut self, header: impl Into<String>) -> Self {
        self.event_id_header = header.into();
        self
    }

    /// QoS used when a publish does not name one
    pub fn with_default_qos(mut self, qos: u8) -> Self {
        self.defaults.qos = Some(qos);
        self
    }

    /// Retain flag used when a publish does not name one
    pub fn with_default_retain(mut self, retain: bool) -> Self {
        self.defaults.retain = Some(retain);
        self
    }

    pub fn event_id_header(&self) -> &str {
        &self.event_id_header
    }

    /// Publish `body` to `topic`
    pub async fn publish(
        &self,
        topic: &str,
        body: impl Into<Bytes>,
        headers: Headers,
    ) -> Result<PublishReceipt> {
        self.publish_with(PublishArgs::new(topic, body).with_headers(headers))
            .await
    }

    /// Publish with full control over content type and key
    ///
    /// Transport errors are returned as-is after being recorded on the span.
    pub async fn publish_with(&self, args: PublishArgs) -> Result<PublishReceipt> {
        let PublishArgs {
            topic,
            body,
            mut headers,
            content_type,
            key,
            qos,
            retain,
        } = args;
        let options = PublishOptions {
            qos: qos.or(self.defaults.qos),
            retain: retain.or(self.defaults.retain),
        };

        let mut span = self.tracer.start_span(
            &format!("{}:PublishMessage", self.transport.kind()),
            &headers,
        );

        let content_type = content_type
            .or_else(|| headers.get(CONTENT_TYPE_HEADER).cloned())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        headers.insert(CONTENT_TYPE_HEADER.to_string(), content_type.clone());

        let event_id = headers
            .entry(self.event_id_header.clone())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        span.set_tag("topic", &topic);
        span.set_tag("content_type", &content_type);
        span.set_tag("event_id", &event_id);
        if let Some(key) = &key {
            span.set_tag("key", key);
        }
        if let Some(qos) = options.qos {
            span.set_tag("qos", &qos.to_string());
        }
        if let Some(retain) = options.retain {
            span.set_tag("retain", &retain.to_string());
        }
        span.log("message", &body);
        span.inject_headers(&mut headers);

        match self.transport.publish(&topic, body, headers, &options).await {
            Ok(receipt) => {
                span.set_tag("message_id", receipt.message_id.as_str());
                if let Some(sequence) = receipt.sequence {
                    span.set_tag("sequence", &sequence.to_string());
                }
                debug!(topic = %topic, message_id = %receipt.message_id, "Message published");
                span.finish();
                Ok(receipt)
            }
            Err(err) => {
                span.set_error(&err.to_string());
                span.finish();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use routeq_transport::{MemoryTransport, SubscribeOptions};
    use routeq_types::Error;

    use super::*;
    use crate::testing::{within, RecordingTracer};

    fn publisher(transport: &Arc<MemoryTransport>, tracer: &RecordingTracer) -> Publisher {
        Publisher::new(transport.clone()).with_tracer(Arc::new(tracer.clone()))
    }

    #[tokio::test]
    async fn test_publish_adds_headers_and_preserves_body() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = RecordingTracer::default();
        let mut subscription = transport
            .subscribe("orders/+", &SubscribeOptions::default())
            .await
            .unwrap();

        let mut headers = Headers::new();
        headers.insert("x-tenant".into(), "acme".into());
        let receipt = publisher(&transport, &tracer)
            .publish("orders/1", "payload", headers)
            .await
            .unwrap();

        let message = within(subscription.recv()).await.unwrap();
        assert_eq!(message.id, receipt.message_id);
        assert_eq!(message.body, Bytes::from_static(b"payload"));
        assert_eq!(message.header("x-tenant"), Some("acme"));
        assert_eq!(message.header(CONTENT_TYPE_HEADER), Some(DEFAULT_CONTENT_TYPE));
        assert_eq!(message.header("x-trace-id"), Some("test-trace"));
        assert!(message.event_id(DEFAULT_EVENT_ID_HEADER).is_some());

        let spans = tracer.finished();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "memory-broker:PublishMessage");
        assert!(spans[0].logs.contains(&"message".to_string()));
        assert_eq!(
            spans[0].tags.get("message_id").map(String::as_str),
            Some(receipt.message_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_existing_event_id_and_content_type_are_kept() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = RecordingTracer::default();
        let mut subscription = transport
            .subscribe("orders/+", &SubscribeOptions::default())
            .await
            .unwrap();

        let args = PublishArgs::new("orders/2", "{}")
            .with_header(DEFAULT_EVENT_ID_HEADER, "evt-42")
            .with_header(CONTENT_TYPE_HEADER, "application/json")
            .with_key("customer-7");
        publisher(&transport, &tracer).publish_with(args).await.unwrap();

        let message = within(subscription.recv()).await.unwrap();
        assert_eq!(message.event_id(DEFAULT_EVENT_ID_HEADER), Some("evt-42"));
        assert_eq!(message.header(CONTENT_TYPE_HEADER), Some("application/json"));
        assert_eq!(
            tracer.finished()[0].tags.get("key").map(String::as_str),
            Some("customer-7")
        );
    }

    #[tokio::test]
    async fn test_explicit_content_type_wins() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = RecordingTracer::default();
        let mut subscription = transport
            .subscribe("#", &SubscribeOptions::default())
            .await
            .unwrap();

        let args = PublishArgs::new("raw", vec![0u8, 1, 2])
            .with_header(CONTENT_TYPE_HEADER, "text/plain")
            .with_content_type("application/octet-stream");
        publisher(&transport, &tracer).publish_with(args).await.unwrap();

        let message = within(subscription.recv()).await.unwrap();
        assert_eq!(
            message.header(CONTENT_TYPE_HEADER),
            Some("application/octet-stream")
        );
    }

    #[tokio::test]
    async fn test_qos_and_retain_fall_back_to_defaults() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = RecordingTracer::default();
        let publisher = publisher(&transport, &tracer)
            .with_default_qos(1)
            .with_default_retain(true);

        publisher
            .publish("status/door", "open", Headers::new())
            .await
            .unwrap();
        publisher
            .publish_with(
                PublishArgs::new("status/light", "on")
                    .with_qos(2)
                    .with_retain(false),
            )
            .await
            .unwrap();

        // Only the publish that kept the default retain flag is retained
        assert_eq!(transport.retained_count(), 1);
        let spans = tracer.finished();
        assert_eq!(spans[0].tags.get("qos").map(String::as_str), Some("1"));
        assert_eq!(spans[0].tags.get("retain").map(String::as_str), Some("true"));
        assert_eq!(spans[1].tags.get("qos").map(String::as_str), Some("2"));
        assert_eq!(spans[1].tags.get("retain").map(String::as_str), Some("false"));
    }

    #[tokio::test]
    async fn test_transport_error_is_returned_unchanged() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = RecordingTracer::default();
        transport.close().await.unwrap();

        let result = publisher(&transport, &tracer)
            .publish("orders/3", "late", Headers::new())
            .await;

        assert!(matches!(result, Err(Error::TransportClosed)));
        let spans = tracer.finished();
        assert_eq!(spans.len(), 1);
        assert_eq!(
            spans[0].error.as_deref(),
            Some(Error::TransportClosed.to_string().as_str())
        );
    }
}
