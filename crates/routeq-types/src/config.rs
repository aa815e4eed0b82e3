//! Engine configuration types for RouteQ

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Default header carrying the fleet-wide event identifier
pub const DEFAULT_EVENT_ID_HEADER: &str = "routeq-event-id";

/// How multiple handler failures on one message are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Only the last failing handler's error is reported
    #[default]
    LastWins,
    /// All failures are joined into one error
    Aggregate,
}

/// Consumer engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EngineConfig {
    /// Service name, used as the dedup lock key prefix
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Overrides the transport kind in logs, spans and lock keys
    #[serde(default)]
    pub worker_type: Option<String>,

    /// Concurrent handler invocations per topic (0 is treated as 1)
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Capacity of the shared inbound channel fed by subscription sources
    #[serde(default = "default_inbound_queue_depth")]
    pub inbound_queue_depth: usize,

    /// Units (waiting for a token or running) accepted before intake stalls
    #[serde(default = "default_max_pending_units")]
    pub max_pending_units: usize,

    /// Header holding the event id used for dedup
    #[serde(default = "default_event_id_header")]
    pub event_id_header: String,

    /// Handler error reporting policy
    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// Log every consumed message at info level
    #[serde(default)]
    pub debug_mode: bool,

    /// Drain deadline used by callers that shut down on a signal
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_service_name() -> String {
    "routeq".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_inbound_queue_depth() -> usize {
    256
}

fn default_max_pending_units() -> usize {
    1024
}

fn default_event_id_header() -> String {
    DEFAULT_EVENT_ID_HEADER.to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            worker_type: None,
            default_concurrency: default_concurrency(),
            inbound_queue_depth: default_inbound_queue_depth(),
            max_pending_units: default_max_pending_units(),
            event_id_header: default_event_id_header(),
            error_policy: ErrorPolicy::default(),
            debug_mode: false,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl EngineConfig {
    /// Create a config for the given service name
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON config document, filling in defaults
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
