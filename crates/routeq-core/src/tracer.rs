//! Observability spans
//!
//! The engine and publisher only talk to the [`Tracer`] / [`Span`]
//! capability. [`LogTracer`] records spans through `tracing` and propagates
//! trace ids in message headers; [`NoopTracer`] drops everything.

use std::time::Instant;

use routeq_types::Headers;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

/// Header carrying the trace id across a publish/consume hop
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Header carrying the publishing span's id
pub const SPAN_ID_HEADER: &str = "x-span-id";

const MAX_LOGGED_BYTES: usize = 512;

/// A unit of traced work
pub trait Span: Send {
    fn trace_id(&self) -> Option<&str>;

    fn set_tag(&mut self, key: &str, value: &str);

    /// Attach a payload (e.g. a message body)
    fn log(&mut self, key: &str, value: &[u8]);

    fn set_error(&mut self, error: &str);

    /// Write correlation headers for the next hop
    fn inject_headers(&self, headers: &mut Headers);

    fn finish(self: Box<Self>);
}

/// Span factory
pub trait Tracer: Send + Sync {
    /// Start a span, continuing the trace found in `parent` if any
    fn start_span(&self, name: &str, parent: &Headers) -> Box<dyn Span>;
}

/// Tracer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

/// Span returned by [`NoopTracer`]
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSpan;

impl Span for NoopSpan {
    fn trace_id(&self) -> Option<&str> {
        None
    }

    fn set_tag(&mut self, _key: &str, _value: &str) {}

    fn log(&mut self, _key: &str, _value: &[u8]) {}

    fn set_error(&mut self, _error: &str) {}

    fn inject_headers(&self, _headers: &mut Headers) {}

    fn finish(self: Box<Self>) {}
}

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str, _parent: &Headers) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Tracer backed by `tracing` spans and events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn start_span(&self, name: &str, parent: &Headers) -> Box<dyn Span> {
        let trace_id = parent
            .get(TRACE_ID_HEADER)
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(new_id);
        let span_id = new_id();
        let parent_span = parent.get(SPAN_ID_HEADER).cloned();
        let span = info_span!(
            "routeq",
            otel.name = %name,
            trace_id = %trace_id,
            span_id = %span_id,
            parent_span_id = parent_span.as_deref().unwrap_or(""),
        );

        Box::new(LogSpan {
            name: name.to_string(),
            trace_id,
            span_id,
            tags: Vec::new(),
            error: None,
            started: Instant::now(),
            span,
        })
    }
}

struct LogSpan {
    name: String,
    trace_id: String,
    span_id: String,
    tags: Vec<(String, String)>,
    error: Option<String>,
    started: Instant,
    span: tracing::Span,
}

impl Span for LogSpan {
    fn trace_id(&self) -> Option<&str> {
        Some(&self.trace_id)
    }

    fn set_tag(&mut self, key: &str, value: &str) {
        self.tags.push((key.to_string(), value.to_string()));
    }

    fn log(&mut self, key: &str, value: &[u8]) {
        let shown = &value[..value.len().min(MAX_LOGGED_BYTES)];
        debug!(
            parent: &self.span,
            key,
            size = value.len(),
            value = %String::from_utf8_lossy(shown),
            "span log"
        );
    }

    fn set_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
    }

    fn inject_headers(&self, headers: &mut Headers) {
        headers.insert(TRACE_ID_HEADER.to_string(), self.trace_id.clone());
        headers.insert(SPAN_ID_HEADER.to_string(), self.span_id.clone());
    }

    fn finish(self: Box<Self>) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match &self.error {
            Some(error) => warn!(
                parent: &self.span,
                name = %self.name,
                elapsed_ms,
                tags = ?self.tags,
                error = %error,
                "span finished with error"
            ),
            None => debug!(
                parent: &self.span,
                name = %self.name,
                elapsed_ms,
                tags = ?self.tags,
                "span finished"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_tracer_starts_new_trace() {
        let span = LogTracer.start_span("op", &Headers::new());
        let trace_id = span.trace_id().unwrap().to_string();
        assert_eq!(trace_id.len(), 32);

        let mut headers = Headers::new();
        span.inject_headers(&mut headers);
        assert_eq!(headers[TRACE_ID_HEADER], trace_id);
        assert!(headers.contains_key(SPAN_ID_HEADER));
        span.finish();
    }

    #[test]
    fn test_log_tracer_continues_parent_trace() {
        let parent = Headers::from([(TRACE_ID_HEADER.to_string(), "abc".to_string())]);
        let mut span = LogTracer.start_span("op", &parent);
        span.set_tag("topic", "t");
        span.log("body", b"payload");
        span.set_error("boom");
        assert_eq!(span.trace_id(), Some("abc"));
        span.finish();
    }

    #[test]
    fn test_noop_span_injects_nothing() {
        let span = NoopTracer.start_span("op", &Headers::new());
        let mut headers = Headers::new();
        span.inject_headers(&mut headers);
        assert!(headers.is_empty());
        assert!(span.trace_id().is_none());
        span.finish();
    }
}
