//! RouteQ Types - Shared domain types for the consumer engine
//!
//! This crate contains all shared types used across RouteQ components.

pub mod config;
pub mod error;
pub mod message;
pub mod stats;

// Re-export commonly used types
pub use config::{EngineConfig, ErrorPolicy, DEFAULT_EVENT_ID_HEADER};
pub use error::{Error, Result};
pub use message::{
    Acknowledger, Headers, InboundMessage, MessageId, MessageSnapshot, NoopAcknowledger,
    PublishReceipt,
};
pub use stats::TransportStats;
