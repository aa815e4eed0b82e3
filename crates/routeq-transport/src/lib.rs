//! RouteQ Transport - Broker transport capability for the consumer engine
//!
//! This crate defines the interface broker adapters implement and
//! provides:
//! - In-memory transport (default, for development/testing)
//!
//! Network adapters (MQTT, STOMP, SQS, Pub/Sub) implement [`Transport`]
//! outside this workspace.

pub mod filter;
pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use traits::{PublishOptions, SubscribeOptions, Subscription, Transport};

#[cfg(feature = "memory")]
pub use memory::{MemoryTransport, MEMORY_BROKER};
