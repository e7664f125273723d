//! State store adapters.
//!
//! A store is the only component that touches persisted lock state. Every
//! primitive here is a single round-trip evaluated against the store's own
//! clock; callers never compare their local time with stored timestamps.

pub mod memory;
pub mod spanner;

use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// A lease granted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Store time after which the lease is implicitly free.
    pub expires_at: OffsetDateTime,
    /// Fencing token. Strictly increases with every acquisition of the
    /// same lock name, including takeovers.
    pub token: i128,
}

/// A non-stale wait queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter {
    pub owner: String,
    pub priority: i64,
    pub requested_at: OffsetDateTime,
}

/// The `locks` table: one row per lock name.
pub trait LockTable: Send + Sync {
    /// Inserts the row if absent, or overwrites it if `expires_at <= now`.
    /// Returns `None` when a live row exists, whoever owns it.
    fn acquire(&self, name: &str, owner: &str, priority: i64, ttl: Duration)
    -> Result<Option<Lease>>;

    /// Extends a live lease held by `owner` to `max(expires_at, now + ttl)`.
    fn refresh(&self, name: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>>;

    /// Deletes the row if `owner` holds it, expired or not.
    fn release(&self, name: &str, owner: &str) -> Result<bool>;

    /// Returns the lease if `owner` holds it and it has not expired.
    fn status(&self, name: &str, owner: &str) -> Result<Option<Lease>>;
}

/// The `lock_queue` table: one row per `(lock_name, owner)`.
///
/// `stale_after` is the heartbeat timeout; entries whose last heartbeat is
/// older than that are ignored by `position` and `head`.
pub trait WaitQueue: Send + Sync {
    /// Upserts an entry, refreshing its priority and heartbeat. The original
    /// `requested_at` is kept when the entry already exists.
    fn enqueue(&self, name: &str, owner: &str, priority: i64) -> Result<()>;

    /// 1 + the number of non-stale entries ordered ahead of `owner`.
    fn position(&self, name: &str, owner: &str, stale_after: Duration) -> Result<u64>;

    /// The non-stale entry with the highest priority and earliest arrival.
    fn head(&self, name: &str, stale_after: Duration) -> Result<Option<Waiter>>;

    /// Touches `heartbeat_at`. Returns false if the entry no longer exists.
    fn heartbeat(&self, name: &str, owner: &str) -> Result<bool>;

    /// Deletes stale entries, returning how many were removed.
    fn evict_stale(&self, name: &str, stale_after: Duration) -> Result<u64>;

    fn dequeue(&self, name: &str, owner: &str) -> Result<bool>;
}

/// A complete backing store.
pub trait Store: LockTable + WaitQueue {}

impl<T: LockTable + WaitQueue> Store for T {}

impl<T: LockTable + ?Sized> LockTable for Arc<T> {
    fn acquire(
        &self,
        name: &str,
        owner: &str,
        priority: i64,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        (**self).acquire(name, owner, priority, ttl)
    }

    fn refresh(&self, name: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>> {
        (**self).refresh(name, owner, ttl)
    }

    fn release(&self, name: &str, owner: &str) -> Result<bool> {
        (**self).release(name, owner)
    }

    fn status(&self, name: &str, owner: &str) -> Result<Option<Lease>> {
        (**self).status(name, owner)
    }
}

impl<T: WaitQueue + ?Sized> WaitQueue for Arc<T> {
    fn enqueue(&self, name: &str, owner: &str, priority: i64) -> Result<()> {
        (**self).enqueue(name, owner, priority)
    }

    fn position(&self, name: &str, owner: &str, stale_after: Duration) -> Result<u64> {
        (**self).position(name, owner, stale_after)
    }

    fn head(&self, name: &str, stale_after: Duration) -> Result<Option<Waiter>> {
        (**self).head(name, stale_after)
    }

    fn heartbeat(&self, name: &str, owner: &str) -> Result<bool> {
        (**self).heartbeat(name, owner)
    }

    fn evict_stale(&self, name: &str, stale_after: Duration) -> Result<u64> {
        (**self).evict_stale(name, stale_after)
    }

    fn dequeue(&self, name: &str, owner: &str) -> Result<bool> {
        (**self).dequeue(name, owner)
    }
}

pub(crate) fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
