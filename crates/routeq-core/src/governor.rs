//! Per-topic concurrency governor
//!
//! Each topic gets a fixed-capacity token pool, created on first use and
//! dropped again once no token is held or awaited for it. Holding a
//! [`ConcurrencyToken`] is required for the duration of one handler
//! invocation; dropping it returns the token, so release happens on every
//! exit path including unwinding.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use dashmap::DashMap;
use routeq_types::{Error, Result};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct TopicPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    /// Reservations and tokens currently referring to this pool
    leases: usize,
}

type Pools = Arc<DashMap<String, TopicPool>>;

type Acquire =
    Pin<Box<dyn Future<Output = std::result::Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

/// Keeps a topic's pool alive; the last lease to go evicts it
#[derive(Debug)]
struct PoolLease {
    pools: Pools,
    topic: String,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let idle = match self.pools.get_mut(&self.topic) {
            Some(mut pool) => {
                pool.leases = pool.leases.saturating_sub(1);
                pool.leases == 0
            }
            None => false,
        };
        if idle {
            // Re-checked under the shard lock; a new lease may have raced in
            self.pools.remove_if(&self.topic, |_, pool| pool.leases == 0);
        }
    }
}

/// A held capacity unit for one topic
#[derive(Debug)]
pub struct ConcurrencyToken {
    // Declared first so the permit is returned before the lease is dropped
    _permit: OwnedSemaphorePermit,
    lease: PoolLease,
}

impl ConcurrencyToken {
    pub fn topic(&self) -> &str {
        &self.lease.topic
    }
}

enum ReservationState {
    Ready(OwnedSemaphorePermit),
    Queued(Acquire),
    Closed,
}

/// A place in a topic's token queue
///
/// Reservations are queued in the order they were made, so waiting on them
/// from separate tasks still hands tokens out first come, first served.
pub struct Reservation {
    lease: PoolLease,
    state: ReservationState,
}

impl Reservation {
    pub fn topic(&self) -> &str {
        &self.lease.topic
    }

    /// Whether a token was free when the reservation was made
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ReservationState::Ready(_))
    }

    /// Wait for the reserved token
    pub async fn wait(self) -> Result<ConcurrencyToken> {
        let Reservation { lease, state } = self;
        let permit = match state {
            ReservationState::Ready(permit) => permit,
            ReservationState::Queued(acquire) => acquire.await.map_err(|_| closed(&lease.topic))?,
            ReservationState::Closed => return Err(closed(&lease.topic)),
        };
        Ok(ConcurrencyToken {
            _permit: permit,
            lease,
        })
    }
}

fn closed(topic: &str) -> Error {
    Error::Internal(format!("token pool for '{topic}' closed"))
}

/// Bounded-concurrency token pools keyed by topic
pub struct ConcurrencyGovernor {
    default_capacity: usize,
    pools: Pools,
}

impl ConcurrencyGovernor {
    /// Create a governor; a capacity of 0 is treated as 1
    pub fn new(default_capacity: usize) -> Self {
        Self {
            default_capacity: default_capacity.max(1),
            pools: Arc::new(DashMap::new()),
        }
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    fn lease(&self, topic: &str, capacity: Option<usize>) -> (Arc<Semaphore>, PoolLease) {
        let capacity = capacity.unwrap_or(self.default_capacity).max(1);
        let mut pool = self
            .pools
            .entry(topic.to_string())
            .or_insert_with(|| TopicPool {
                capacity,
                semaphore: Arc::new(Semaphore::new(capacity)),
                leases: 0,
            });
        pool.leases += 1;
        let semaphore = Arc::clone(&pool.semaphore);
        drop(pool);

        let lease = PoolLease {
            pools: Arc::clone(&self.pools),
            topic: topic.to_string(),
        };
        (semaphore, lease)
    }

    /// Join the queue for a token on `topic` without waiting for it
    ///
    /// `capacity` only applies when the topic's pool is created.
    pub async fn reserve(&self, topic: &str, capacity: Option<usize>) -> Reservation {
        let (semaphore, lease) = self.lease(topic, capacity);
        let mut acquire: Acquire = Box::pin(semaphore.acquire_owned());

        // One poll takes a free token or enqueues the waiter
        let state = match poll_fn(|cx| Poll::Ready(acquire.as_mut().poll(cx))).await {
            Poll::Ready(Ok(permit)) => ReservationState::Ready(permit),
            Poll::Ready(Err(_)) => ReservationState::Closed,
            Poll::Pending => ReservationState::Queued(acquire),
        };
        Reservation { lease, state }
    }

    /// Wait for a token on `topic`
    ///
    /// `capacity` only applies when the topic's pool is created; waiters are
    /// served in arrival order.
    pub async fn acquire(&self, topic: &str, capacity: Option<usize>) -> Result<ConcurrencyToken> {
        self.reserve(topic, capacity).await.wait().await
    }

    /// Take a token without waiting
    pub fn try_acquire(&self, topic: &str, capacity: Option<usize>) -> Option<ConcurrencyToken> {
        let (semaphore, lease) = self.lease(topic, capacity);
        let permit = semaphore.try_acquire_owned().ok()?;
        Some(ConcurrencyToken {
            _permit: permit,
            lease,
        })
    }

    /// Tokens currently held for `topic`
    pub fn in_flight(&self, topic: &str) -> usize {
        self.pools
            .get(topic)
            .map(|pool| pool.capacity - pool.semaphore.available_permits())
            .unwrap_or(0)
    }

    /// Tokens currently held across all topics
    pub fn total_in_flight(&self) -> usize {
        self.pools
            .iter()
            .map(|pool| pool.capacity - pool.semaphore.available_permits())
            .sum()
    }

    /// Topics with a live pool
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

impl Default for ConcurrencyGovernor {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_default_capacity_serializes_topic() {
        let governor = ConcurrencyGovernor::default();
        let token = governor.acquire("a", None).await.unwrap();
        assert_eq!(token.topic(), "a");
        assert_eq!(governor.in_flight("a"), 1);

        assert!(governor.try_acquire("a", None).is_none());
        // Other topics are independent
        let other = governor.try_acquire("b", None).unwrap();
        assert_eq!(governor.total_in_flight(), 2);

        drop(token);
        drop(other);
        assert_eq!(governor.total_in_flight(), 0);
        assert!(governor.try_acquire("a", None).is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let governor = Arc::new(ConcurrencyGovernor::new(1));
        let held = governor.acquire("t", None).await.unwrap();

        let waiter = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move { governor.acquire("t", None).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_capacity_override_applies_on_creation() {
        let governor = ConcurrencyGovernor::new(0);
        assert_eq!(governor.default_capacity(), 1);

        let first = governor.try_acquire("wide", Some(2)).unwrap();
        let second = governor.try_acquire("wide", Some(5)).unwrap();
        assert!(governor.try_acquire("wide", None).is_none());
        assert_eq!(governor.in_flight("wide"), 2);
        drop((first, second));
    }

    #[tokio::test]
    async fn test_token_released_on_panic() {
        let governor = Arc::new(ConcurrencyGovernor::default());
        let task = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move {
                let _token = governor.acquire("p", None).await.unwrap();
                panic!("handler blew up");
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(governor.in_flight("p"), 0);
    }

    #[tokio::test]
    async fn test_idle_pools_are_evicted() {
        let governor = ConcurrencyGovernor::default();
        for n in 0..10_000 {
            let token = governor.acquire(&format!("user/{n}"), None).await.unwrap();
            drop(token);
        }
        assert_eq!(governor.pool_count(), 0);

        // A failed try_acquire leaves nothing behind either
        let held = governor.try_acquire("busy", None).unwrap();
        assert!(governor.try_acquire("busy", None).is_none());
        assert_eq!(governor.pool_count(), 1);
        drop(held);
        assert_eq!(governor.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_pool_kept_while_reservation_waits() {
        let governor = ConcurrencyGovernor::default();
        let held = governor.acquire("t", None).await.unwrap();
        let queued = governor.reserve("t", None).await;
        assert!(!queued.is_ready());

        drop(held);
        assert_eq!(governor.pool_count(), 1);

        let token = tokio::time::timeout(Duration::from_secs(1), queued.wait())
            .await
            .expect("queued reservation should be served")
            .unwrap();
        assert_eq!(token.topic(), "t");
        assert_eq!(governor.in_flight("t"), 1);

        drop(token);
        assert_eq!(governor.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_reservations_are_served_in_order() {
        let governor = ConcurrencyGovernor::default();
        let first = governor.reserve("t", None).await;
        assert!(first.is_ready());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut waiters = Vec::new();
        for n in 0..5 {
            let reservation = governor.reserve("t", None).await;
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                let token = reservation.wait().await.unwrap();
                tx.send(n).unwrap();
                drop(token);
            }));
        }
        // Give the tasks a chance to start in any order
        tokio::task::yield_now().await;

        drop(first.wait().await.unwrap());
        for waiter in waiters {
            waiter.await.unwrap();
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some(n) = rx.recv().await {
            order.push(n);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }
}
