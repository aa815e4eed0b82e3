//! Transport statistics

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Delivery counters reported by a transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TransportStats {
    /// Messages accepted by `publish`
    pub published: u64,

    /// Deliveries handed to subscription sources (one per matching subscription)
    pub delivered: u64,

    /// Deliveries acknowledged
    pub acked: u64,

    /// Deliveries negatively acknowledged
    pub nacked: u64,

    /// Deliveries dropped after exhausting redeliveries
    pub failed: u64,

    /// Deliveries awaiting settlement
    pub in_flight: u64,

    /// Active subscriptions
    pub subscriptions: u64,
}
