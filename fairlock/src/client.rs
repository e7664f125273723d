use crate::error::Result;
use crate::fairness::{Fairness, PriorityQueue, Unordered};
use crate::store::{Lease, Store};
use crate::wait::Wait;
use log::*;
use std::time::{Duration, Instant};

/// Priority used when the caller does not set one.
pub const DEFAULT_PRIORITY: i64 = 0;
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Who wants which lock, for how long, and how urgently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub name: String,
    pub owner: String,
    /// Higher is more urgent. Ignored by [`Unordered`].
    pub priority: i64,
    pub ttl: Duration,
}

impl LockRequest {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> LockRequest {
        LockRequest {
            name: name.into(),
            owner: owner.into(),
            priority: DEFAULT_PRIORITY,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn priority(mut self, priority: i64) -> LockRequest {
        self.priority = priority;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> LockRequest {
        self.ttl = ttl;
        self
    }
}

/// Outcome of a non-blocking [`LockClient::try_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Acquired(Lease),
    /// Someone else holds a live lease. `position` is the caller's place in
    /// the wait queue (1 = next), when the fairness strategy keeps one.
    Contended { position: Option<u64> },
}

impl Attempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Attempt::Acquired(_))
    }

    pub fn lease(&self) -> Option<Lease> {
        match self {
            Attempt::Acquired(lease) => Some(*lease),
            Attempt::Contended { .. } => None,
        }
    }

    pub fn position(&self) -> Option<u64> {
        match self {
            Attempt::Acquired(_) => None,
            Attempt::Contended { position } => *position,
        }
    }
}

/// Lock operations over a store, ordered by a fairness strategy.
///
/// The client holds no lock state of its own; ownership is whatever the
/// store says it is, so one client can be shared by many threads and any
/// number of clients in other processes can compete on the same store.
///
/// Holders must refresh or re-check their lease at intervals shorter than
/// its TTL and stop work as soon as [`check_lock_status`] reports `None`;
/// nothing notifies a holder that it lost the lock.
///
/// [`check_lock_status`]: LockClient::check_lock_status
pub struct LockClient<S, F = PriorityQueue> {
    store: S,
    fairness: F,
}

impl<S: Store> LockClient<S, Unordered> {
    /// A plain mutual-exclusion lock: waiters race on every poll.
    pub fn plain(store: S) -> Self {
        LockClient::new(store, Unordered)
    }
}

impl<S: Store> LockClient<S, PriorityQueue> {
    /// A lock whose waiters acquire by priority, then arrival.
    pub fn fair(store: S) -> Self {
        LockClient::new(store, PriorityQueue::default())
    }
}

impl<S: Store, F: Fairness> LockClient<S, F> {
    pub fn new(store: S, fairness: F) -> Self {
        LockClient { store, fairness }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn fairness(&self) -> &F {
        &self.fairness
    }

    /// One acquisition attempt. On contention the caller is enrolled in the
    /// wait queue (if any) and told its position. On success any queue entry
    /// left by an earlier contended attempt is removed.
    pub fn try_lock(&self, req: &LockRequest) -> Result<Attempt> {
        if let Some(lease) = self.acquire(req)? {
            self.fairness.leave(&self.store, &req.name, &req.owner);
            return Ok(Attempt::Acquired(lease));
        }

        let position = self.fairness.contended(&self.store, req)?;
        debug!(
            "[{}] {} contended, position={position:?}",
            req.name, req.owner
        );

        Ok(Attempt::Contended { position })
    }

    /// Blocks until the lock is acquired, `wait` is cancelled, or its
    /// deadline passes. Store errors end the wait immediately.
    ///
    /// The caller's queue entry is removed however this returns.
    pub fn lock(&self, req: &LockRequest, wait: &Wait) -> Result<Lease> {
        let start = Instant::now();
        if let Attempt::Acquired(lease) = self.try_lock(req)? {
            return Ok(lease);
        }

        let _leave = scopeguard::guard((), |_| {
            self.fairness.leave(&self.store, &req.name, &req.owner);
        });

        let mut pacer = wait.poll.pacer();
        loop {
            let mut pause = pacer.next_pause();
            if let Some(max) = self.fairness.max_pause() {
                pause = pause.min(max);
            }

            wait.sleep(pause)?;
            if self.fairness.eligible(&self.store, req)? {
                if let Some(lease) = self.acquire(req)? {
                    info!(
                        "[{}] {} acquired after {:?}",
                        req.name,
                        req.owner,
                        start.elapsed()
                    );
                    return Ok(lease);
                }
            }

            self.fairness.waiting(&self.store, req);
        }
    }

    /// Extends a live lease held by `owner`. `None` means the lease is gone:
    /// it expired, was taken over, or was never held.
    pub fn refresh_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>> {
        let lease = self.store.refresh(name, owner, ttl)?;
        if lease.is_none() {
            info!("[{name}] {owner} refresh rejected, lease lost");
        }

        Ok(lease)
    }

    /// Deletes the lock row if `owner` holds it. Releasing a lock you do not
    /// hold is a no-op returning false.
    pub fn release_lock(&self, name: &str, owner: &str) -> Result<bool> {
        let released = self.store.release(name, owner)?;
        debug!("[{name}] {owner} released={released}");
        Ok(released)
    }

    /// [`release_lock`](Self::release_lock), plus removal of any leftover
    /// wait queue entry for `owner`.
    pub fn unlock(&self, name: &str, owner: &str) -> Result<bool> {
        let released = self.release_lock(name, owner)?;
        self.fairness.leave(&self.store, name, owner);
        Ok(released)
    }

    /// `Some(lease)` while `owner` holds a live lease on `name`.
    pub fn check_lock_status(&self, name: &str, owner: &str) -> Result<Option<Lease>> {
        self.store.status(name, owner)
    }

    fn acquire(&self, req: &LockRequest) -> Result<Option<Lease>> {
        let lease = self
            .store
            .acquire(&req.name, &req.owner, req.priority, req.ttl)?;
        if let Some(lease) = &lease {
            info!(
                "[{}] {} acquired, expires_at={}, token={}",
                req.name, req.owner, lease.expires_at, lease.token
            );
        }

        Ok(lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fairness::DEFAULT_HEARTBEAT_TIMEOUT;
    use crate::store::memory::MemoryStore;
    use crate::wait::CancelToken;
    use std::sync::{Arc, Mutex};
    use std::thread;

    const TTL: Duration = Duration::from_secs(5);

    fn fast() -> Wait {
        Wait::every(Duration::from_millis(5)).timeout(Duration::from_secs(20))
    }

    #[test]
    fn takeover_after_expiry() {
        let client = LockClient::plain(MemoryStore::new());
        let a = LockRequest::new("L", "a").ttl(TTL);
        let b = LockRequest::new("L", "b").ttl(TTL);

        let first = client.try_lock(&a).unwrap();
        assert!(first.is_acquired());
        assert_eq!(
            client.try_lock(&b).unwrap(),
            Attempt::Contended { position: None }
        );

        client.store().advance(Duration::from_secs(6));
        let second = client.try_lock(&b).unwrap();
        assert!(second.is_acquired());
        assert!(second.lease().unwrap().token > first.lease().unwrap().token);
        assert_eq!(client.check_lock_status("L", "a").unwrap(), None);
        assert_eq!(client.check_lock_status("L", "b").unwrap(), second.lease());
    }

    #[test]
    fn refresh_extends_only_for_live_owner() {
        let client = LockClient::plain(MemoryStore::new());
        let lease = client
            .try_lock(&LockRequest::new("L", "a").ttl(TTL))
            .unwrap()
            .lease()
            .unwrap();

        assert_eq!(client.refresh_lock("L", "b", TTL).unwrap(), None);

        client.store().advance(Duration::from_secs(3));
        let refreshed = client.refresh_lock("L", "a", TTL).unwrap().unwrap();
        assert!(refreshed.expires_at > lease.expires_at);
        assert_eq!(refreshed.token, lease.token);

        client.store().advance(Duration::from_secs(6));
        assert_eq!(client.refresh_lock("L", "a", TTL).unwrap(), None);
    }

    #[test]
    fn release_is_idempotent() {
        let client = LockClient::fair(MemoryStore::new());
        client.try_lock(&LockRequest::new("L", "a")).unwrap();
        assert!(client.release_lock("L", "a").unwrap());
        assert!(!client.release_lock("L", "a").unwrap());
        assert!(!client.unlock("L", "a").unwrap());
    }

    #[test]
    fn release_by_stranger_keeps_lock() {
        let client = LockClient::plain(MemoryStore::new());
        client.try_lock(&LockRequest::new("L", "a")).unwrap();
        assert!(!client.release_lock("L", "b").unwrap());
        assert!(client.check_lock_status("L", "a").unwrap().is_some());
    }

    #[test]
    fn try_lock_reports_queue_position() {
        let client = LockClient::fair(MemoryStore::new());
        client
            .try_lock(&LockRequest::new("L", "holder").ttl(Duration::from_secs(60)))
            .unwrap();

        let w1 = client.try_lock(&LockRequest::new("L", "w1").priority(1)).unwrap();
        let w2 = client.try_lock(&LockRequest::new("L", "w2").priority(10)).unwrap();
        let w3 = client.try_lock(&LockRequest::new("L", "w3").priority(1)).unwrap();
        assert_eq!(w1.position(), Some(1));
        assert_eq!(w2.position(), Some(1));
        assert_eq!(w3.position(), Some(3));

        // Asking again does not lose w1's place behind w2.
        let again = client.try_lock(&LockRequest::new("L", "w1").priority(1)).unwrap();
        assert_eq!(again.position(), Some(2));
    }

    #[test]
    fn stale_waiters_do_not_count() {
        let client = LockClient::fair(MemoryStore::new());
        client
            .try_lock(&LockRequest::new("L", "holder").ttl(Duration::from_secs(600)))
            .unwrap();
        client
            .try_lock(&LockRequest::new("L", "gone").priority(50))
            .unwrap();

        client
            .store()
            .advance(DEFAULT_HEARTBEAT_TIMEOUT + Duration::from_secs(1));
        let live = client
            .try_lock(&LockRequest::new("L", "live").priority(1))
            .unwrap();
        assert_eq!(live.position(), Some(1));
    }

    #[test]
    fn unlock_removes_stray_queue_entry() {
        let client = LockClient::fair(MemoryStore::new());
        client.try_lock(&LockRequest::new("L", "holder")).unwrap();
        client.try_lock(&LockRequest::new("L", "a")).unwrap();
        assert_eq!(
            client.store().waiters("L", DEFAULT_HEARTBEAT_TIMEOUT),
            vec!["a"]
        );

        assert!(!client.unlock("L", "a").unwrap());
        assert!(
            client
                .store()
                .waiters("L", DEFAULT_HEARTBEAT_TIMEOUT)
                .is_empty()
        );
    }

    #[test]
    fn acquiring_after_contention_leaves_the_queue() {
        let client = Arc::new(LockClient::fair(MemoryStore::new()));
        client
            .try_lock(&LockRequest::new("L", "h").ttl(TTL))
            .unwrap();

        let x = LockRequest::new("L", "x").priority(10).ttl(TTL);
        assert_eq!(client.try_lock(&x).unwrap().position(), Some(1));

        client.store().advance(TTL + Duration::from_secs(1));
        assert!(client.try_lock(&x).unwrap().is_acquired());
        assert!(
            client
                .store()
                .waiters("L", DEFAULT_HEARTBEAT_TIMEOUT)
                .is_empty()
        );

        // The holder no longer counts ahead of anyone.
        let w = LockRequest::new("L", "w").priority(1);
        assert_eq!(client.try_lock(&w).unwrap().position(), Some(1));

        let c = client.clone();
        let waiter = thread::spawn(move || {
            let wait = Wait::every(Duration::from_millis(10)).timeout(Duration::from_secs(2));
            c.lock(&w, &wait)
        });

        wait_for_waiters(&client, 1);
        assert!(client.release_lock("L", "x").unwrap());
        assert!(waiter.join().unwrap().is_ok());
        assert!(client.check_lock_status("L", "w").unwrap().is_some());
    }

    #[test]
    fn long_poll_interval_is_capped_by_heartbeat_timeout() {
        let client = LockClient::new(
            MemoryStore::new(),
            PriorityQueue::new(Duration::from_millis(200)),
        );
        client
            .try_lock(&LockRequest::new("L", "h").ttl(Duration::from_millis(150)))
            .unwrap();

        let start = Instant::now();
        let wait = Wait::every(Duration::from_secs(60)).timeout(Duration::from_secs(5));
        client.lock(&LockRequest::new("L", "w"), &wait).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn lock_returns_immediately_when_free() {
        let client = LockClient::fair(MemoryStore::new());
        let lease = client.lock(&LockRequest::new("L", "a"), &fast()).unwrap();
        assert_eq!(client.check_lock_status("L", "a").unwrap(), Some(lease));
    }

    #[test]
    fn lock_waits_for_expiry() {
        let client = LockClient::plain(MemoryStore::new());
        client
            .try_lock(&LockRequest::new("L", "a").ttl(Duration::from_millis(100)))
            .unwrap();

        let start = Instant::now();
        client.lock(&LockRequest::new("L", "b"), &fast()).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(client.check_lock_status("L", "a").unwrap().is_none());
    }

    #[test]
    fn lock_gives_up_at_deadline_and_leaves_queue() {
        let client = LockClient::fair(MemoryStore::new());
        client
            .try_lock(&LockRequest::new("L", "holder").ttl(Duration::from_secs(60)))
            .unwrap();

        let wait = Wait::every(Duration::from_millis(5)).timeout(Duration::from_millis(50));
        let err = client.lock(&LockRequest::new("L", "a"), &wait).unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(
            client
                .store()
                .waiters("L", DEFAULT_HEARTBEAT_TIMEOUT)
                .is_empty()
        );
    }

    #[test]
    fn lock_can_be_cancelled() {
        let client = Arc::new(LockClient::fair(MemoryStore::new()));
        client
            .try_lock(&LockRequest::new("L", "holder").ttl(Duration::from_secs(60)))
            .unwrap();

        let token = CancelToken::new();
        let wait = Wait::every(Duration::from_millis(5)).cancel(token.clone());
        let c = client.clone();
        let h = thread::spawn(move || c.lock(&LockRequest::new("L", "a"), &wait));

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert!(matches!(h.join().unwrap(), Err(Error::Cancelled)));
    }

    fn wait_for_waiters<F: Fairness>(client: &LockClient<MemoryStore, F>, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while client.store().waiters("L", DEFAULT_HEARTBEAT_TIMEOUT).len() < n {
            assert!(Instant::now() < deadline, "waiters never enqueued");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn waiters_acquire_by_priority_then_arrival() {
        let client = Arc::new(LockClient::fair(MemoryStore::new()));
        let holder = LockRequest::new("L", "holder").ttl(Duration::from_secs(60));
        assert!(client.try_lock(&holder).unwrap().is_acquired());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = vec![];
        for (i, (owner, priority)) in [("w1", 1), ("w2", 10), ("w3", 1)].into_iter().enumerate() {
            let (c, order) = (client.clone(), order.clone());
            handles.push(thread::spawn(move || {
                let req = LockRequest::new("L", owner).priority(priority);
                c.lock(&req, &fast()).unwrap();
                order.lock().unwrap().push(owner);
                thread::sleep(Duration::from_millis(20));
                assert!(c.unlock("L", owner).unwrap());
            }));

            wait_for_waiters(&client, i + 1);
        }

        assert!(client.unlock("L", "holder").unwrap());
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["w2", "w1", "w3"]);
    }

    #[test]
    fn high_priority_late_arrival_goes_first() {
        let client = Arc::new(LockClient::fair(MemoryStore::new()));
        let holder = LockRequest::new("L", "holder").ttl(Duration::from_secs(60));
        assert!(client.try_lock(&holder).unwrap().is_acquired());

        let order = Arc::new(Mutex::new(Vec::new()));
        let spawn = |owner: &'static str, priority: i64| {
            let (c, order) = (client.clone(), order.clone());
            thread::spawn(move || {
                let req = LockRequest::new("L", owner).priority(priority);
                c.lock(&req, &fast()).unwrap();
                order.lock().unwrap().push(owner);
                c.unlock("L", owner).unwrap();
            })
        };

        let low = spawn("low", 1);
        wait_for_waiters(&client, 1);
        let high = spawn("high", 100);
        wait_for_waiters(&client, 2);

        client.unlock("L", "holder").unwrap();
        low.join().unwrap();
        high.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        let client = Arc::new(LockClient::plain(MemoryStore::new()));
        let inside = Arc::new(Mutex::new(0u32));
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let (c, inside) = (client.clone(), inside.clone());
                thread::spawn(move || {
                    let owner = format!("worker-{i}");
                    let req = LockRequest::new("L", owner.as_str());
                    c.lock(&req, &fast()).unwrap();
                    {
                        let mut n = inside.lock().unwrap();
                        *n += 1;
                        assert_eq!(*n, 1, "two holders at once");
                    }
                    thread::sleep(Duration::from_millis(5));
                    *inside.lock().unwrap() -= 1;
                    assert!(c.release_lock("L", &owner).unwrap());
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
