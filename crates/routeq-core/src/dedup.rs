//! Dedup lock gate
//!
//! When several consumer instances subscribe to the same topic, a message's
//! event id is claimed through a [`Locker`] so only one instance processes
//! it. The lock key is `{service}:{kind}-lock:{event_id}`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Distributed mutual-exclusion capability
#[async_trait]
pub trait Locker: Send + Sync {
    /// Whether `key` is currently held by some instance
    async fn is_locked(&self, key: &str) -> bool;

    /// Try to take `key`; `false` means another instance holds it
    async fn lock(&self, key: &str) -> bool;

    /// Release `key`
    async fn unlock(&self, key: &str);
}

/// Locker for single-instance deployments; never reports a lock
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLocker;

#[async_trait]
impl Locker for NoopLocker {
    async fn is_locked(&self, _key: &str) -> bool {
        false
    }

    async fn lock(&self, _key: &str) -> bool {
        true
    }

    async fn unlock(&self, _key: &str) {}
}

/// Process-local locker, shared by engines in the same process
#[derive(Debug, Default)]
pub struct MemoryLocker {
    keys: DashMap<String, ()>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> usize {
        self.keys.len()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn is_locked(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    async fn lock(&self, key: &str) -> bool {
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        }
    }

    async fn unlock(&self, key: &str) {
        self.keys.remove(key);
    }
}

/// Outcome of [`DedupGate::claim`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The message has no event id; nothing to dedup
    Unkeyed,
    /// This instance holds the lock under the key
    Claimed(String),
    /// Another instance is processing the event
    AlreadyClaimed(String),
}

/// Claims event ids through a [`Locker`]
pub struct DedupGate {
    locker: Arc<dyn Locker>,
    prefix: String,
}

impl DedupGate {
    pub fn new(locker: Arc<dyn Locker>, service_name: &str, broker_kind: &str) -> Self {
        Self {
            locker,
            prefix: format!("{service_name}:{broker_kind}-lock:"),
        }
    }

    pub fn lock_key(&self, event_id: &str) -> String {
        format!("{}{}", self.prefix, event_id)
    }

    /// Claim an event id; empty or missing ids are never gated
    pub async fn claim(&self, event_id: Option<&str>) -> Claim {
        let Some(event_id) = event_id.filter(|id| !id.is_empty()) else {
            return Claim::Unkeyed;
        };

        let key = self.lock_key(event_id);
        if self.locker.is_locked(&key).await || !self.locker.lock(&key).await {
            debug!(key = %key, "Event already claimed");
            return Claim::AlreadyClaimed(key);
        }
        Claim::Claimed(key)
    }

    /// Release a claim taken by this instance
    pub async fn release(&self, claim: &Claim) {
        if let Claim::Claimed(key) = claim {
            self.locker.unlock(key).await;
        }
    }
}
