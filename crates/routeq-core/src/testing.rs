//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use routeq_types::Headers;

use crate::dedup::Locker;
use crate::tracer::{Span, Tracer, SPAN_ID_HEADER, TRACE_ID_HEADER};

#[derive(Debug, Clone, Default)]
pub struct RecordedSpan {
    pub name: String,
    pub tags: HashMap<String, String>,
    pub logs: Vec<String>,
    pub error: Option<String>,
}

/// Keeps every finished span for inspection
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    finished: Arc<Mutex<Vec<RecordedSpan>>>,
    started: Arc<AtomicUsize>,
}

impl RecordingTracer {
    pub fn finished(&self) -> Vec<RecordedSpan> {
        self.finished.lock().clone()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

struct RecordingSpan {
    record: RecordedSpan,
    sink: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl Span for RecordingSpan {
    fn trace_id(&self) -> Option<&str> {
        Some("test-trace")
    }

    fn set_tag(&mut self, key: &str, value: &str) {
        self.record.tags.insert(key.to_string(), value.to_string());
    }

    fn log(&mut self, key: &str, _value: &[u8]) {
        self.record.logs.push(key.to_string());
    }

    fn set_error(&mut self, error: &str) {
        self.record.error = Some(error.to_string());
    }

    fn inject_headers(&self, headers: &mut Headers) {
        headers.insert(TRACE_ID_HEADER.to_string(), "test-trace".to_string());
        headers.insert(SPAN_ID_HEADER.to_string(), "test-span".to_string());
    }

    fn finish(self: Box<Self>) {
        self.sink.lock().push(self.record);
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, name: &str, _parent: &Headers) -> Box<dyn Span> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Box::new(RecordingSpan {
            record: RecordedSpan {
                name: name.to_string(),
                ..Default::default()
            },
            sink: Arc::clone(&self.finished),
        })
    }
}

/// Locker with a fixed answer that counts calls
#[derive(Debug, Default)]
pub struct StubLocker {
    pub locked: bool,
    pub locks: AtomicUsize,
    pub unlocks: AtomicUsize,
}

impl StubLocker {
    pub fn locked() -> Self {
        Self {
            locked: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Locker for StubLocker {
    async fn is_locked(&self, _key: &str) -> bool {
        self.locked
    }

    async fn lock(&self, _key: &str) -> bool {
        self.locks.fetch_add(1, Ordering::SeqCst);
        !self.locked
    }

    async fn unlock(&self, _key: &str) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Fail the test instead of hanging on a future that never completes
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}
