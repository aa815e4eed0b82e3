//! Demo handler modules mounted by the server
//!
//! Every handled message is appended to a bounded [`Deliveries`] log that
//! the HTTP API exposes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use routeq_core::{EventContext, HandlerEntry, HandlerGroup, HandlerResult, Module};
use routeq_types::MessageSnapshot;
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

/// Number of deliveries kept for inspection
pub const DELIVERY_LOG_CAPACITY: usize = 100;

/// One message as seen by a demo handler
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeliveryRecord {
    /// Module that handled the message
    pub module: String,
    /// Matched route pattern
    pub route: String,
    /// Parameters bound by the route
    pub params: HashMap<String, String>,
    /// Dedup key (event id, or message id when absent)
    pub key: String,
    pub message: MessageSnapshot,
}

/// Bounded, newest-first log of handled messages
#[derive(Debug, Clone)]
pub struct Deliveries {
    records: Arc<Mutex<VecDeque<DeliveryRecord>>>,
    capacity: usize,
}

impl Deliveries {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, module: &str, ctx: &EventContext) {
        let record = DeliveryRecord {
            module: module.to_string(),
            route: ctx.route().to_string(),
            params: ctx.params().clone(),
            key: ctx.key().to_string(),
            message: ctx.snapshot(),
        };

        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_back();
        }
        records.push_front(record);
    }

    /// Up to `limit` records, newest first
    pub fn recent(&self, limit: usize) -> Vec<DeliveryRecord> {
        self.records.lock().iter().take(limit).cloned().collect()
    }
}

/// Order lifecycle events
pub struct OrdersModule {
    deliveries: Deliveries,
}

impl OrdersModule {
    pub fn new(deliveries: Deliveries) -> Self {
        Self { deliveries }
    }
}

impl Module for OrdersModule {
    fn name(&self) -> &str {
        "orders"
    }

    fn mount_handlers(&self, group: &mut HandlerGroup) {
        let deliveries = self.deliveries.clone();
        group.mount("orders/:order_id/created", move |ctx: EventContext| {
            let deliveries = deliveries.clone();
            async move {
                info!(
                    order_id = ctx.param("order_id").unwrap_or_default(),
                    trace_id = ctx.trace_id().unwrap_or_default(),
                    "Order created"
                );
                deliveries.record("orders", &ctx);
                Ok(())
            }
        });

        let deliveries = self.deliveries.clone();
        group.add(
            HandlerEntry::new("orders/:order_id/cancelled")
                .max_concurrency(4)
                .handler(move |ctx: EventContext| {
                    let deliveries = deliveries.clone();
                    async move {
                        info!(
                            order_id = ctx.param("order_id").unwrap_or_default(),
                            "Order cancelled"
                        );
                        deliveries.record("orders", &ctx);
                        Ok(())
                    }
                }),
        );
    }
}

/// Outbound notifications, one topic per channel
pub struct NotificationsModule {
    deliveries: Deliveries,
}

impl NotificationsModule {
    pub fn new(deliveries: Deliveries) -> Self {
        Self { deliveries }
    }
}

async fn reject_empty(ctx: EventContext) -> HandlerResult {
    if ctx.body().is_empty() {
        anyhow::bail!("notification for channel {:?} has no body", ctx.param("channel"));
    }
    Ok(())
}

impl Module for NotificationsModule {
    fn name(&self) -> &str {
        "notifications"
    }

    fn mount_handlers(&self, group: &mut HandlerGroup) {
        let deliveries = self.deliveries.clone();
        group.add(
            HandlerEntry::new("notifications/:channel")
                .config(routeq_core::registry::CONFIG_QOS, 1)
                .handler(move |ctx: EventContext| {
                    let deliveries = deliveries.clone();
                    async move {
                        deliveries.record("notifications", &ctx);
                        Ok(())
                    }
                })
                .handler(reject_empty),
        );
    }
}
