//! RouteQ Core - topic-routed consumer engine
//!
//! This crate contains:
//! - Router: pattern tree resolving concrete topics to handlers
//! - Handler registry: modules, handler entries and their settings
//! - Concurrency governor: per-topic in-flight limits
//! - Dedup gate: cross-instance claims on event ids
//! - Consumer engine: subscribe, dispatch, drain on shutdown
//! - Publisher: traced publishing over the same transport

pub mod context;
pub mod dedup;
pub mod engine;
pub mod governor;
pub mod publisher;
pub mod registry;
pub mod router;
pub mod tracer;

#[cfg(test)]
mod testing;

// Re-exports
pub use context::EventContext;
pub use dedup::{Claim, DedupGate, Locker, MemoryLocker, NoopLocker};
pub use engine::{ConsumerEngine, EngineBuilder, RouteInfo};
pub use governor::{ConcurrencyGovernor, ConcurrencyToken};
pub use publisher::{PublishArgs, Publisher, CONTENT_TYPE_HEADER, DEFAULT_CONTENT_TYPE};
pub use registry::{
    Handler, HandlerEntry, HandlerGroup, HandlerRegistry, HandlerResult, Module,
    RegisteredHandler,
};
pub use router::{RouteMatch, Router};
pub use tracer::{LogTracer, NoopSpan, NoopTracer, Span, Tracer};
