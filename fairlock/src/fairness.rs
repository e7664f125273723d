//! Fairness strategies decide who may attempt an acquisition while a lock is
//! contended.
//!
//! The strategies are cooperative: the store never enforces the head gate,
//! so ordering only holds among competitors using the same strategy.

use crate::client::LockRequest;
use crate::error::Result;
use crate::store::WaitQueue;
use log::*;
use std::time::Duration;

/// Waiters silent for longer than this are treated as gone.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

pub trait Fairness: Send + Sync {
    /// Called after a failed immediate attempt. Returns the caller's queue
    /// position, if the strategy keeps a queue.
    fn contended(&self, queue: &dyn WaitQueue, req: &LockRequest) -> Result<Option<u64>>;

    /// Whether the caller may attempt an acquisition on this poll.
    fn eligible(&self, queue: &dyn WaitQueue, req: &LockRequest) -> Result<bool>;

    /// Called after an ineligible or failed poll, before sleeping.
    fn waiting(&self, queue: &dyn WaitQueue, req: &LockRequest);

    /// Longest pause allowed between polls of a blocking wait.
    fn max_pause(&self) -> Option<Duration> {
        None
    }

    /// Called when a blocking wait ends, whether it acquired or gave up, and
    /// on unlock. Must not fail the caller's operation.
    fn leave(&self, queue: &dyn WaitQueue, name: &str, owner: &str);
}

/// No queue: every poll races for the lock. Priorities are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unordered;

impl Fairness for Unordered {
    fn contended(&self, _: &dyn WaitQueue, _: &LockRequest) -> Result<Option<u64>> {
        Ok(None)
    }

    fn eligible(&self, _: &dyn WaitQueue, _: &LockRequest) -> Result<bool> {
        Ok(true)
    }

    fn waiting(&self, _: &dyn WaitQueue, _: &LockRequest) {}

    fn leave(&self, _: &dyn WaitQueue, _: &str, _: &str) {}
}

/// Priority wait queue with heartbeats.
///
/// Waiters are ordered by priority (highest first), then arrival. Only the
/// head of the non-stale queue attempts to acquire; everyone else heartbeats
/// and sleeps. Entries whose heartbeat is older than `heartbeat_timeout` are
/// skipped and reaped by whoever polls next.
///
/// Blocking waits never pause longer than half of `heartbeat_timeout`, so
/// a live waiter is not reaped between its own polls.
#[derive(Debug, Clone, Copy)]
pub struct PriorityQueue {
    heartbeat_timeout: Duration,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        PriorityQueue::new(DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

impl PriorityQueue {
    pub fn new(heartbeat_timeout: Duration) -> PriorityQueue {
        PriorityQueue { heartbeat_timeout }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }
}

impl Fairness for PriorityQueue {
    fn contended(&self, queue: &dyn WaitQueue, req: &LockRequest) -> Result<Option<u64>> {
        queue.enqueue(&req.name, &req.owner, req.priority)?;
        let position = queue.position(&req.name, &req.owner, self.heartbeat_timeout)?;
        Ok(Some(position))
    }

    fn eligible(&self, queue: &dyn WaitQueue, req: &LockRequest) -> Result<bool> {
        match queue.evict_stale(&req.name, self.heartbeat_timeout) {
            Ok(0) => {}
            Ok(n) => debug!("[{}] evicted {n} stale waiter(s)", req.name),
            Err(e) => warn!("[{}] evict stale waiters failed: {e}", req.name),
        }

        let head = queue.head(&req.name, self.heartbeat_timeout)?;
        Ok(match head {
            None => true,
            Some(w) => w.owner == req.owner,
        })
    }

    fn waiting(&self, queue: &dyn WaitQueue, req: &LockRequest) {
        match queue.heartbeat(&req.name, &req.owner) {
            Ok(true) => {}
            Ok(false) => {
                // Reaped as stale; rejoin. Arrival order restarts.
                info!("[{}] {} rejoining queue", req.name, req.owner);
                if let Err(e) = queue.enqueue(&req.name, &req.owner, req.priority) {
                    warn!("[{}] {} rejoin failed: {e}", req.name, req.owner);
                }
            }
            Err(e) => warn!("[{}] {} heartbeat failed: {e}", req.name, req.owner),
        }
    }

    fn max_pause(&self) -> Option<Duration> {
        Some(self.heartbeat_timeout / 2)
    }

    fn leave(&self, queue: &dyn WaitQueue, name: &str, owner: &str) {
        if let Err(e) = queue.dequeue(name, owner) {
            warn!("[{name}] {owner} dequeue failed: {e}");
        }
    }
}
