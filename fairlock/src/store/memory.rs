use super::{Lease, LockTable, WaitQueue, Waiter};
use crate::error::Result;
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
struct LockRow {
    owner: String,
    priority: i64,
    expires_at: OffsetDateTime,
    token: i128,
}

#[derive(Debug, Clone)]
struct QueueRow {
    priority: i64,
    requested_at: OffsetDateTime,
    heartbeat_at: OffsetDateTime,
    // Arrival order; breaks ties between equal `requested_at` values.
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    locks: HashMap<String, LockRow>,
    queue: HashMap<String, HashMap<String, QueueRow>>,
    seq: u64,
    last_token: i128,
    skew: Duration,
}

impl State {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + self.skew
    }

    fn next_token(&mut self, now: OffsetDateTime) -> i128 {
        self.last_token = now.unix_timestamp_nanos().max(self.last_token + 1);
        self.last_token
    }

    fn live_waiters(
        &self,
        name: &str,
        stale_after: Duration,
    ) -> impl Iterator<Item = (&String, &QueueRow)> {
        let cutoff = self.now() - stale_after;
        self.queue
            .get(name)
            .into_iter()
            .flat_map(|q| q.iter())
            .filter(move |(_, row)| row.heartbeat_at >= cutoff)
    }
}

fn queue_order(a: &QueueRow, b: &QueueRow) -> Ordering {
    (Reverse(a.priority), a.requested_at, a.seq).cmp(&(Reverse(b.priority), b.requested_at, b.seq))
}

/// An in-process store with the same semantics as the Spanner adapter.
///
/// Every participant must share the same instance (typically behind an
/// `Arc`), so this suits tests and single-process deployments. The clock can
/// be moved forward with [`advance`](MemoryStore::advance) to exercise expiry
/// without sleeping.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Current store time.
    pub fn now(&self) -> OffsetDateTime {
        self.state().now()
    }

    /// Moves the store clock forward.
    pub fn advance(&self, d: Duration) {
        self.state().skew += d;
    }

    /// Owner and priority of the live holder of `name`, if any.
    pub fn holder(&self, name: &str) -> Option<(String, i64)> {
        let state = self.state();
        let now = state.now();
        state
            .locks
            .get(name)
            .filter(|row| row.expires_at > now)
            .map(|row| (row.owner.clone(), row.priority))
    }

    /// Owners of the non-stale entries for `name`, head first.
    pub fn waiters(&self, name: &str, stale_after: Duration) -> Vec<String> {
        let state = self.state();
        let mut rows: Vec<_> = state.live_waiters(name, stale_after).collect();
        rows.sort_by(|a, b| queue_order(a.1, b.1));
        rows.into_iter().map(|(owner, _)| owner.clone()).collect()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LockTable for MemoryStore {
    fn acquire(
        &self,
        name: &str,
        owner: &str,
        priority: i64,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let mut state = self.state();
        let now = state.now();
        if let Some(row) = state.locks.get(name) {
            if row.expires_at > now {
                return Ok(None);
            }
        }

        let token = state.next_token(now);
        let row = LockRow {
            owner: owner.to_string(),
            priority,
            expires_at: now + ttl,
            token,
        };

        let lease = Lease {
            expires_at: row.expires_at,
            token,
        };

        state.locks.insert(name.to_string(), row);
        Ok(Some(lease))
    }

    fn refresh(&self, name: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>> {
        let mut state = self.state();
        let now = state.now();
        match state.locks.get_mut(name) {
            Some(row) if row.owner == owner && row.expires_at > now => {
                row.expires_at = row.expires_at.max(now + ttl);
                Ok(Some(Lease {
                    expires_at: row.expires_at,
                    token: row.token,
                }))
            }
            _ => Ok(None),
        }
    }

    fn release(&self, name: &str, owner: &str) -> Result<bool> {
        let mut state = self.state();
        let owned = state.locks.get(name).is_some_and(|row| row.owner == owner);
        if owned {
            state.locks.remove(name);
        }

        Ok(owned)
    }

    fn status(&self, name: &str, owner: &str) -> Result<Option<Lease>> {
        let state = self.state();
        let now = state.now();
        Ok(state
            .locks
            .get(name)
            .filter(|row| row.owner == owner && row.expires_at > now)
            .map(|row| Lease {
                expires_at: row.expires_at,
                token: row.token,
            }))
    }
}

impl WaitQueue for MemoryStore {
    fn enqueue(&self, name: &str, owner: &str, priority: i64) -> Result<()> {
        let mut state = self.state();
        let now = state.now();
        state.seq += 1;
        let seq = state.seq;
        let queue = state.queue.entry(name.to_string()).or_default();
        queue
            .entry(owner.to_string())
            .and_modify(|row| {
                row.priority = priority;
                row.heartbeat_at = now;
            })
            .or_insert(QueueRow {
                priority,
                requested_at: now,
                heartbeat_at: now,
                seq,
            });

        Ok(())
    }

    fn position(&self, name: &str, owner: &str, stale_after: Duration) -> Result<u64> {
        let state = self.state();
        let Some(me) = state.queue.get(name).and_then(|q| q.get(owner)) else {
            return Ok(1);
        };

        let ahead = state
            .live_waiters(name, stale_after)
            .filter(|(o, row)| o.as_str() != owner && queue_order(row, me) == Ordering::Less)
            .count();

        Ok(ahead as u64 + 1)
    }

    fn head(&self, name: &str, stale_after: Duration) -> Result<Option<Waiter>> {
        let state = self.state();
        Ok(state
            .live_waiters(name, stale_after)
            .min_by(|a, b| queue_order(a.1, b.1))
            .map(|(owner, row)| Waiter {
                owner: owner.clone(),
                priority: row.priority,
                requested_at: row.requested_at,
            }))
    }

    fn heartbeat(&self, name: &str, owner: &str) -> Result<bool> {
        let mut state = self.state();
        let now = state.now();
        match state.queue.get_mut(name).and_then(|q| q.get_mut(owner)) {
            Some(row) => {
                row.heartbeat_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn evict_stale(&self, name: &str, stale_after: Duration) -> Result<u64> {
        let mut state = self.state();
        let cutoff = state.now() - stale_after;
        let Some(queue) = state.queue.get_mut(name) else {
            return Ok(0);
        };

        let before = queue.len();
        queue.retain(|_, row| row.heartbeat_at >= cutoff);
        let evicted = (before - queue.len()) as u64;
        if queue.is_empty() {
            state.queue.remove(name);
        }

        Ok(evicted)
    }

    fn dequeue(&self, name: &str, owner: &str) -> Result<bool> {
        let mut state = self.state();
        let Some(queue) = state.queue.get_mut(name) else {
            return Ok(false);
        };

        let removed = queue.remove(owner).is_some();
        if queue.is_empty() {
            state.queue.remove(name);
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);
    const STALE: Duration = Duration::from_secs(10);

    #[test]
    fn acquire_then_takeover_after_expiry() {
        let store = MemoryStore::new();
        let a = store.acquire("L", "a", 3, TTL).unwrap().unwrap();
        assert_eq!(store.holder("L"), Some(("a".to_string(), 3)));
        assert!(store.acquire("L", "b", 0, TTL).unwrap().is_none());
        assert!(store.acquire("L", "a", 0, TTL).unwrap().is_none());

        store.advance(Duration::from_secs(6));
        let b = store.acquire("L", "b", 0, TTL).unwrap().unwrap();
        assert!(b.token > a.token);
        assert!(b.expires_at > a.expires_at);
        assert!(store.status("L", "a").unwrap().is_none());
        assert_eq!(store.status("L", "b").unwrap(), Some(b));
    }

    #[test]
    fn refresh_requires_live_ownership_and_never_shrinks() {
        let store = MemoryStore::new();
        let lease = store.acquire("L", "a", 0, Duration::from_secs(30)).unwrap().unwrap();

        assert!(store.refresh("L", "b", TTL).unwrap().is_none());

        let shorter = store.refresh("L", "a", Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(shorter.expires_at, lease.expires_at);
        assert_eq!(shorter.token, lease.token);

        store.advance(Duration::from_secs(20));
        let longer = store.refresh("L", "a", Duration::from_secs(60)).unwrap().unwrap();
        assert!(longer.expires_at > lease.expires_at);

        store.advance(Duration::from_secs(61));
        assert!(store.refresh("L", "a", TTL).unwrap().is_none());
    }

    #[test]
    fn release_only_by_owner() {
        let store = MemoryStore::new();
        store.acquire("L", "a", 0, TTL).unwrap().unwrap();
        assert!(!store.release("L", "b").unwrap());
        assert!(store.release("L", "a").unwrap());
        assert!(!store.release("L", "a").unwrap());
        assert!(store.acquire("L", "b", 0, TTL).unwrap().is_some());
    }

    #[test]
    fn queue_orders_by_priority_then_arrival() {
        let store = MemoryStore::new();
        store.enqueue("L", "w1", 1).unwrap();
        store.enqueue("L", "w2", 10).unwrap();
        store.enqueue("L", "w3", 1).unwrap();

        assert_eq!(store.waiters("L", STALE), vec!["w2", "w1", "w3"]);
        assert_eq!(store.position("L", "w2", STALE).unwrap(), 1);
        assert_eq!(store.position("L", "w1", STALE).unwrap(), 2);
        assert_eq!(store.position("L", "w3", STALE).unwrap(), 3);
        assert_eq!(store.head("L", STALE).unwrap().unwrap().owner, "w2");

        // Re-enqueueing keeps the original arrival.
        store.enqueue("L", "w1", 1).unwrap();
        assert_eq!(store.position("L", "w1", STALE).unwrap(), 2);
    }

    #[test]
    fn stale_entries_do_not_count() {
        let store = MemoryStore::new();
        store.enqueue("L", "old", 100).unwrap();
        store.advance(Duration::from_secs(11));
        store.enqueue("L", "new", 1).unwrap();

        assert_eq!(store.position("L", "new", STALE).unwrap(), 1);
        assert_eq!(store.head("L", STALE).unwrap().unwrap().owner, "new");

        assert_eq!(store.evict_stale("L", STALE).unwrap(), 1);
        assert!(!store.heartbeat("L", "old").unwrap());
        assert!(store.heartbeat("L", "new").unwrap());
    }

    #[test]
    fn dequeue_clears_entry() {
        let store = MemoryStore::new();
        store.enqueue("L", "a", 0).unwrap();
        assert!(store.dequeue("L", "a").unwrap());
        assert!(!store.dequeue("L", "a").unwrap());
        assert!(store.head("L", STALE).unwrap().is_none());
    }
}
