//! Handler registry
//!
//! Modules mount their handlers into a [`HandlerGroup`] once at startup;
//! the registry collects every group and refuses the same pattern twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use routeq_types::{Error, Result};
use serde_json::Value;
use tracing::debug;

use crate::context::EventContext;
use crate::router::SEPARATOR;

/// Config key for the subscription QoS
pub const CONFIG_QOS: &str = "qos";

/// Outcome of one handler invocation
pub type HandlerResult = anyhow::Result<()>;

/// A processing function bound to a topic pattern
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: EventContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: EventContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// Handler chain and settings for one pattern
///
/// Immutable once registered.
#[derive(Clone)]
pub struct HandlerEntry {
    pattern: String,
    handlers: Vec<Arc<dyn Handler>>,
    auto_ack: bool,
    disable_trace: bool,
    max_concurrency: Option<usize>,
    config: HashMap<String, Value>,
}

impl HandlerEntry {
    /// Create an entry with auto-ack on and tracing enabled
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            handlers: Vec::new(),
            auto_ack: true,
            disable_trace: false,
            max_concurrency: None,
            config: HashMap::new(),
        }
    }

    /// Append a handler to the chain
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Acknowledge on the handler's behalf once the chain completes
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn disable_trace(mut self, disable_trace: bool) -> Self {
        self.disable_trace = disable_trace;
        self
    }

    /// Concurrent invocations allowed per topic for this route
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Adapter-specific setting, e.g. [`CONFIG_QOS`]
    pub fn config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub fn is_trace_disabled(&self) -> bool {
        self.disable_trace
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// QoS from the config map, if set to a value in `0..=255`
    pub fn qos(&self) -> Option<u8> {
        self.config_value(CONFIG_QOS)
            .and_then(Value::as_u64)
            .and_then(|qos| u8::try_from(qos).ok())
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("pattern", &self.pattern)
            .field("handlers", &self.handlers.len())
            .field("auto_ack", &self.auto_ack)
            .field("disable_trace", &self.disable_trace)
            .field("max_concurrency", &self.max_concurrency)
            .field("config", &self.config)
            .finish()
    }
}

/// Entries mounted by one module
#[derive(Debug, Default)]
pub struct HandlerGroup {
    entries: Vec<HandlerEntry>,
}

impl HandlerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: HandlerEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    /// Mount a single handler with default settings
    pub fn mount(&mut self, pattern: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.add(HandlerEntry::new(pattern).handler(handler))
    }

    pub fn entries(&self) -> &[HandlerEntry] {
        &self.entries
    }
}

/// A unit of business logic contributing handlers
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn mount_handlers(&self, group: &mut HandlerGroup);
}

/// A handler entry together with the module that mounted it
#[derive(Debug, Clone)]
pub struct RegisteredHandler {
    pub module: String,
    pub entry: HandlerEntry,
}

/// Every handler entry known at startup
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: Vec<RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the handler groups of all modules
    pub fn from_modules(modules: &[Arc<dyn Module>]) -> Result<Self> {
        let mut registry = Self::new();
        for module in modules {
            let mut group = HandlerGroup::new();
            module.mount_handlers(&mut group);
            for entry in group.entries {
                registry.register(module.name(), entry)?;
            }
        }
        Ok(registry)
    }

    /// Add one entry; the same pattern may only be registered once
    pub fn register(&mut self, module: impl Into<String>, entry: HandlerEntry) -> Result<()> {
        let module = module.into();
        let pattern = entry.pattern().trim_matches(SEPARATOR);

        if entry.handlers().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "pattern '{pattern}' in module '{module}' has no handlers"
            )));
        }

        if let Some(existing) = self
            .entries
            .iter()
            .find(|r| r.entry.pattern().trim_matches(SEPARATOR) == pattern)
        {
            return Err(Error::DuplicatePattern {
                pattern: pattern.to_string(),
                first: existing.module.clone(),
                second: module,
            });
        }

        debug!(pattern = %pattern, module = %module, "Handler registered");
        self.entries.push(RegisteredHandler { module, entry });
        Ok(())
    }

    pub fn entries(&self) -> &[RegisteredHandler] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<RegisteredHandler> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
