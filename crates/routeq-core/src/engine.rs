//! Consumer engine
//!
//! Subscribes every registered pattern on the transport, fans the
//! subscription sources into one inbound channel, and dispatches each
//! message: route lookup, dedup claim, a queued reservation for the
//! topic's concurrency token, then a unit task that waits for the token and
//! runs the handler chain. A busy topic only holds up its own messages;
//! intake stalls once `max_pending_units` units are outstanding. Shutdown
//! stops intake and waits for every outstanding unit to finalize.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use routeq_transport::{SubscribeOptions, Subscription, Transport};
use routeq_types::{EngineConfig, Error, InboundMessage, Result};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::context::EventContext;
use crate::dedup::{Claim, DedupGate, Locker, NoopLocker};
use crate::governor::{ConcurrencyGovernor, ConcurrencyToken, Reservation};
use crate::publisher::Publisher;
use crate::registry::{HandlerEntry, HandlerRegistry};
use crate::router::Router;
use crate::tracer::{LogTracer, NoopSpan, Span, Tracer};

/// A mounted route as seen by operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub module: String,
    pub pattern: String,
    /// Broker-native subscription filter
    pub filter: String,
}

struct Route {
    info: RouteInfo,
    entry: HandlerEntry,
}

/// A message tagged with the route whose subscription received it
struct Delivery {
    route: usize,
    message: InboundMessage,
}

/// Counting barrier over outstanding units of work
struct UnitTracker {
    active: AtomicUsize,
    idle: Notify,
}

struct UnitGuard {
    tracker: Arc<UnitTracker>,
}

impl UnitTracker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    fn enter(self: &Arc<Self>) -> UnitGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        UnitGuard {
            tracker: Arc::clone(self),
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// Builder for [`ConsumerEngine`]
pub struct EngineBuilder {
    transport: Arc<dyn Transport>,
    registry: HandlerRegistry,
    config: EngineConfig,
    locker: Arc<dyn Locker>,
    tracer: Arc<dyn Tracer>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Locker used for cross-instance dedup (default: [`NoopLocker`])
    pub fn locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = locker;
        self
    }

    /// Tracer for consumer spans (default: [`LogTracer`])
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Compile the routes; configuration errors are fatal
    pub fn build(self) -> Result<ConsumerEngine> {
        let config = self.config;
        if config.service_name.trim().is_empty() {
            return Err(Error::InvalidConfig("service_name must not be empty".into()));
        }
        if config.event_id_header.trim().is_empty() {
            return Err(Error::InvalidConfig("event_id_header must not be empty".into()));
        }

        let name = config
            .worker_type
            .clone()
            .unwrap_or_else(|| self.transport.kind().to_string());

        let mut router = Router::new();
        let mut routes = Vec::with_capacity(self.registry.len());
        for registered in self.registry.into_entries() {
            let filter = router.add_route(registered.entry.pattern(), routes.len())?;
            info!(
                worker = %name,
                pattern = %registered.entry.pattern(),
                filter = %filter,
                module = %registered.module,
                "Route mounted"
            );
            routes.push(Route {
                info: RouteInfo {
                    module: registered.module,
                    pattern: registered.entry.pattern().to_string(),
                    filter,
                },
                entry: registered.entry,
            });
        }

        let governor = ConcurrencyGovernor::new(config.default_concurrency);
        let pending = Arc::new(Semaphore::new(config.max_pending_units.max(1)));
        let dedup = DedupGate::new(self.locker, &config.service_name, &name);
        let (stop, _) = watch::channel(false);

        Ok(ConsumerEngine {
            inner: Arc::new(EngineInner {
                name,
                config,
                transport: self.transport,
                tracer: self.tracer,
                router,
                routes,
                governor,
                pending,
                dedup,
                stop,
                serving: AtomicBool::new(false),
                units: UnitTracker::new(),
            }),
        })
    }
}

struct EngineInner {
    name: String,
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    tracer: Arc<dyn Tracer>,
    router: Router<usize>,
    routes: Vec<Route>,
    governor: ConcurrencyGovernor,
    /// Bounds units accepted but not yet finalized
    pending: Arc<Semaphore>,
    dedup: DedupGate,
    stop: watch::Sender<bool>,
    serving: AtomicBool,
    units: Arc<UnitTracker>,
}

/// Topic-routed, concurrency-bounded consumer
#[derive(Clone)]
pub struct ConsumerEngine {
    inner: Arc<EngineInner>,
}

impl ConsumerEngine {
    pub fn builder(transport: Arc<dyn Transport>, registry: HandlerRegistry) -> EngineBuilder {
        EngineBuilder {
            transport,
            registry,
            config: EngineConfig::default(),
            locker: Arc::new(NoopLocker),
            tracer: Arc::new(LogTracer),
        }
    }

    /// Broker kind this engine consumes from
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        self.inner.routes.iter().map(|r| r.info.clone()).collect()
    }

    /// Handler invocations currently holding a concurrency token
    pub fn in_flight(&self) -> usize {
        self.inner.governor.total_in_flight()
    }

    /// Publisher sharing this engine's transport, tracer and event-id header
    pub fn publisher(&self) -> Publisher {
        Publisher::new(Arc::clone(&self.inner.transport))
            .with_tracer(Arc::clone(&self.inner.tracer))
            .with_event_id_header(self.inner.config.event_id_header.clone())
    }

    /// Consume until [`shutdown`](Self::shutdown) is called
    ///
    /// Returns once intake has stopped and every accepted message has been
    /// handed to its processing unit.
    pub async fn serve(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.serving.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyServing);
        }
        let _dispatch_unit = inner.units.enter();
        let mut stop = inner.stop.subscribe();
        let stopping = *stop.borrow_and_update();
        if stopping {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(inner.config.inbound_queue_depth.max(1));
        for (index, route) in inner.routes.iter().enumerate() {
            let options = SubscribeOptions {
                qos: route.entry.qos(),
            };
            let subscription = inner.transport.subscribe(&route.info.filter, &options).await?;
            tokio::spawn(forward(index, subscription, tx.clone(), inner.stop.subscribe()));
        }
        drop(tx);

        info!(
            worker = %inner.name,
            topics = inner.routes.len(),
            service = %inner.config.service_name,
            "Consumer engine running"
        );

        if inner.routes.is_empty() {
            stopped(&mut stop).await;
            return Ok(());
        }

        while let Some(delivery) = rx.recv().await {
            Arc::clone(inner).dispatch(delivery).await;
        }

        debug!(worker = %inner.name, "Dispatch loop drained");
        Ok(())
    }

    /// Stop intake and wait for in-flight units, then close the transport
    ///
    /// Units are never cancelled; if `timeout` passes first the engine
    /// keeps draining in the background and `ShutdownTimeout` is returned.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        info!(worker = %inner.name, "Stopping consumer engine");
        inner.stop.send_replace(true);

        let pending = inner.units.active();
        if pending > 0 {
            info!(worker = %inner.name, pending, "Waiting for in-flight units to finish");
        }

        if tokio::time::timeout(timeout, inner.units.wait_idle())
            .await
            .is_err()
        {
            let pending = inner.units.active();
            warn!(worker = %inner.name, pending, "Shutdown deadline exceeded");
            return Err(Error::ShutdownTimeout(pending));
        }

        inner.transport.close().await?;
        info!(worker = %inner.name, "Consumer engine stopped");
        Ok(())
    }
}

impl EngineInner {
    async fn dispatch(self: Arc<Self>, delivery: Delivery) {
        let Delivery {
            route: source,
            message,
        } = delivery;

        let Some(found) = self.router.match_route(&message.topic) else {
            warn!(
                worker = %self.name,
                topic = %message.topic,
                message_id = %message.id,
                "No handler for topic, leaving message unacknowledged"
            );
            return;
        };
        let route_index = *found.handler;
        let params = found.params;

        // Overlapping filters deliver one publish to several subscriptions;
        // only the copy from the matched route's own subscription is handled.
        if route_index != source {
            debug!(
                topic = %message.topic,
                message_id = %message.id,
                route = %self.routes[route_index].info.pattern,
                "Settling duplicate delivery from overlapping subscription"
            );
            if let Err(err) = message.acknowledger().ack().await {
                warn!(topic = %message.topic, error = %err, "Failed to settle duplicate delivery");
            }
            return;
        }
        let entry = &self.routes[route_index].entry;

        let Ok(pending) = Arc::clone(&self.pending).acquire_owned().await else {
            error!(topic = %message.topic, "Pending unit limiter closed");
            return;
        };

        let claim = self
            .dedup
            .claim(message.event_id(&self.config.event_id_header))
            .await;
        if let Claim::AlreadyClaimed(key) = &claim {
            debug!(topic = %message.topic, key = %key, "Skipping message claimed elsewhere");
            return;
        }

        let reservation = self
            .governor
            .reserve(&message.topic, entry.concurrency())
            .await;

        let unit = self.units.enter();
        let engine = Arc::clone(&self);
        tokio::spawn(async move {
            let _guards = (unit, pending);
            engine
                .run_unit(route_index, message, params, claim, reservation)
                .await;
        });
    }

    async fn run_unit(
        &self,
        route_index: usize,
        message: InboundMessage,
        params: HashMap<String, String>,
        claim: Claim,
        reservation: Reservation,
    ) {
        match reservation.wait().await {
            Ok(token) => {
                self.process(route_index, message, params, claim, token)
                    .await
            }
            Err(err) => {
                error!(topic = %message.topic, error = %err, "Failed to acquire concurrency token");
                self.dedup.release(&claim).await;
            }
        }
    }

    async fn process(
        &self,
        route_index: usize,
        message: InboundMessage,
        params: HashMap<String, String>,
        claim: Claim,
        token: ConcurrencyToken,
    ) {
        let entry = &self.routes[route_index].entry;

        let mut span: Box<dyn Span> = if entry.is_trace_disabled() {
            Box::new(NoopSpan)
        } else {
            self.tracer
                .start_span(&format!("{}:ConsumeMessage", self.name), &message.headers)
        };
        span.set_tag("worker_type", &self.name);
        span.set_tag("topic", &message.topic);
        span.set_tag("route", entry.pattern());
        span.set_tag("message_id", message.id.as_str());
        span.set_tag("delivery_count", &message.delivery_count.to_string());
        span.log("body", &message.body);

        if self.config.debug_mode {
            info!(worker = %self.name, topic = %message.topic, "Consuming message");
        } else {
            debug!(worker = %self.name, topic = %message.topic, "Consuming message");
        }

        let event_id = message
            .event_id(&self.config.event_id_header)
            .map(str::to_string);
        let ctx = EventContext::new(
            self.name.clone(),
            entry.pattern(),
            message,
            params,
            event_id.as_deref(),
            span.trace_id().map(str::to_string),
        );

        let chain = {
            let ctx = ctx.clone();
            let handlers = entry.handlers().to_vec();
            tokio::spawn(async move {
                for handler in handlers {
                    if let Err(err) = handler.handle(ctx.clone()).await {
                        ctx.set_error(Error::Handler(format!("{err:#}")));
                    }
                }
            })
        };

        if let Err(err) = chain.await {
            let failure = chain_failure(err);
            if matches!(failure, Error::Panic(_)) {
                span.set_tag("panic", "true");
                error!(worker = %self.name, topic = %ctx.topic(), error = %failure, "Handler panicked");
            } else {
                warn!(worker = %self.name, topic = %ctx.topic(), error = %failure, "Handler chain did not complete");
            }
            ctx.set_error(failure);
        }

        drop(token);
        self.dedup.release(&claim).await;

        if entry.is_auto_ack() && !ctx.is_settled() {
            if let Err(err) = ctx.ack().await {
                warn!(
                    topic = %ctx.topic(),
                    message_id = %ctx.message_id(),
                    error = %err,
                    "Auto-ack failed, message left for redelivery"
                );
            }
        }

        if let Some(error) = ctx.final_error(self.config.error_policy) {
            span.set_error(&error);
        }
        span.finish();
    }
}

/// Forward one subscription source into the shared inbound channel
async fn forward(
    route: usize,
    mut subscription: Subscription,
    tx: mpsc::Sender<Delivery>,
    mut stop: watch::Receiver<bool>,
) {
    let filter = subscription.filter().to_string();
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            message = subscription.recv() => match message {
                Some(message) => {
                    if tx.send(Delivery { route, message }).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!(filter = %filter, "Subscription source ended");
                    break;
                }
            },
        }
    }
}

/// Resolves once the stop flag is set (or its sender is gone)
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *stop.borrow_and_update();
        if stopping || stop.changed().await.is_err() {
            return;
        }
    }
}

/// Only a panicking chain is reported as [`Error::Panic`]
fn chain_failure(err: JoinError) -> Error {
    if err.is_panic() {
        Error::Panic(panic_reason(err.into_panic()))
    } else {
        Error::Internal("handler chain cancelled".to_string())
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        (*reason).to_string()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_string()
    }
}
