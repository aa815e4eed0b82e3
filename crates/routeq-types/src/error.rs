//! Error types for RouteQ
//!
//! Defines all error types used throughout the engine, grouped the way they
//! are handled: configuration errors halt boot, transport errors surface to
//! the caller (or leave a delivery unacknowledged), handler errors are
//! recorded and never stop the engine.

use thiserror::Error;

/// Main error type for RouteQ operations
#[derive(Error, Debug)]
pub enum Error {
    /// A route with the same segment sequence already has a handler
    #[error("Route already has a handler: {0}")]
    DuplicateRoute(String),

    /// Two patterns introduce differently named parameters at the same depth
    #[error("Parameter name conflict in '{pattern}': ':{found}' clashes with ':{existing}'")]
    ParamConflict {
        pattern: String,
        existing: String,
        found: String,
    },

    /// Same pattern mounted by more than one module
    #[error("Pattern '{pattern}' mounted by both '{first}' and '{second}'")]
    DuplicatePattern {
        pattern: String,
        first: String,
        second: String,
    },

    /// Invalid engine or handler configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Broker transport failure (subscribe, publish, ack)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Transport has been closed
    #[error("Transport closed")]
    TransportClosed,

    /// Delivery is unknown to the transport (already settled)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Business-logic failure inside a handler
    #[error("Handler error: {0}")]
    Handler(String),

    /// Handler panicked; recovered at the processing-unit boundary
    #[error("Handler panicked: {0}")]
    Panic(String),

    /// `serve` called on an engine that is already serving
    #[error("Engine is already serving")]
    AlreadyServing,

    /// Drain did not finish before the shutdown deadline
    #[error("Shutdown deadline exceeded with {0} unit(s) still in flight")]
    ShutdownTimeout(usize),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a fatal startup configuration error
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DuplicateRoute(_)
                | Error::ParamConflict { .. }
                | Error::DuplicatePattern { .. }
                | Error::InvalidConfig(_)
        )
    }

    /// Whether this error came from the broker transport
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::TransportClosed | Error::MessageNotFound(_)
        )
    }
}

/// Result type alias for RouteQ operations
pub type Result<T> = std::result::Result<T, Error>;
