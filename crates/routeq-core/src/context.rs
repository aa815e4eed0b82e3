//! Per-message execution context
//!
//! Every handler in a chain receives a clone of the same [`EventContext`],
//! so errors recorded by one handler are visible to the engine when the
//! chain completes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use routeq_types::{ErrorPolicy, Headers, InboundMessage, MessageId, MessageSnapshot, Result};

struct ContextInner {
    worker_type: String,
    route: String,
    params: HashMap<String, String>,
    key: String,
    trace_id: Option<String>,
    message: InboundMessage,
    settled: AtomicBool,
    errors: Mutex<Vec<String>>,
}

/// Message plus routing data handed to handlers
#[derive(Clone)]
pub struct EventContext {
    inner: Arc<ContextInner>,
}

impl EventContext {
    pub(crate) fn new(
        worker_type: impl Into<String>,
        route: impl Into<String>,
        message: InboundMessage,
        params: HashMap<String, String>,
        event_id: Option<&str>,
        trace_id: Option<String>,
    ) -> Self {
        let key = event_id
            .map(str::to_string)
            .unwrap_or_else(|| message.id.to_string());
        Self {
            inner: Arc::new(ContextInner {
                worker_type: worker_type.into(),
                route: route.into(),
                params,
                key,
                trace_id,
                message,
                settled: AtomicBool::new(false),
                errors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Broker kind the message was consumed from
    pub fn worker_type(&self) -> &str {
        &self.inner.worker_type
    }

    /// Registered pattern that matched the topic
    pub fn route(&self) -> &str {
        &self.inner.route
    }

    /// Concrete topic the message arrived on
    pub fn topic(&self) -> &str {
        &self.inner.message.topic
    }

    /// Parameter captured by the router
    pub fn param(&self, name: &str) -> Option<&str> {
        self.inner.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.inner.params
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.inner.message.header(key)
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.message.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.message.body
    }

    /// Body as UTF-8, if valid
    pub fn body_as_str(&self) -> Option<&str> {
        self.inner.message.body_as_str()
    }

    /// Event id when the message carries one, otherwise the message id
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn message_id(&self) -> &MessageId {
        &self.inner.message.id
    }

    pub fn delivery_count(&self) -> u32 {
        self.inner.message.delivery_count
    }

    /// Serializable copy of the underlying message
    pub fn snapshot(&self) -> MessageSnapshot {
        self.inner.message.snapshot()
    }

    /// Trace id of the consumer span, when tracing is enabled
    pub fn trace_id(&self) -> Option<&str> {
        self.inner.trace_id.as_deref()
    }

    /// Acknowledge the delivery; later calls are no-ops
    pub async fn ack(&self) -> Result<()> {
        if self.inner.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.inner.message.acknowledger().ack().await;
        if result.is_err() {
            self.inner.settled.store(false, Ordering::Release);
        }
        result
    }

    /// Reject the delivery for redelivery; no-op once settled
    pub async fn nack(&self) -> Result<()> {
        if self.inner.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.inner.message.acknowledger().nack().await;
        if result.is_err() {
            self.inner.settled.store(false, Ordering::Release);
        }
        result
    }

    /// Whether a handler (or the engine) already acked or nacked
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::Acquire)
    }

    /// Record a failure for this message
    pub fn set_error(&self, error: impl fmt::Display) {
        self.inner.errors.lock().push(error.to_string());
    }

    /// Last recorded failure
    pub fn error(&self) -> Option<String> {
        self.inner.errors.lock().last().cloned()
    }

    /// Every recorded failure, in order
    pub fn errors(&self) -> Vec<String> {
        self.inner.errors.lock().clone()
    }

    /// Failure reported for the whole chain under `policy`
    pub fn final_error(&self, policy: ErrorPolicy) -> Option<String> {
        let errors = self.inner.errors.lock();
        match policy {
            ErrorPolicy::LastWins => errors.last().cloned(),
            ErrorPolicy::Aggregate if errors.is_empty() => None,
            ErrorPolicy::Aggregate => Some(errors.join("; ")),
        }
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("worker_type", &self.inner.worker_type)
            .field("route", &self.inner.route)
            .field("topic", &self.inner.message.topic)
            .field("key", &self.inner.key)
            .finish()
    }
}
