//! A priority-aware distributed lock built on leases in a shared store.
//!
//! Competing processes coordinate only through the store: a lock is a row
//! holding an owner and an expiry, taken atomically when absent or expired.
//! Callers that cannot get the lock wait in a per-lock queue ordered by
//! priority then arrival, heartbeating so that dead waiters can be skipped.
//!
//! ```no_run
//! use fairlock_rs::*;
//! use std::time::Duration;
//!
//! # fn main() -> Result<()> {
//! let store = SpannerStore::connect(StoreConfig::from_env()?)?;
//! let client = LockClient::fair(store);
//! let req = LockRequest::new("reports", owner_id())
//!     .priority(10)
//!     .ttl(Duration::from_secs(5));
//!
//! let lease = client.lock(&req, &Wait::every(Duration::from_millis(500)))?;
//! // ... work, calling check_lock_status() well within the TTL ...
//! client.unlock(&req.name, &req.owner)?;
//! # let _ = lease;
//! # Ok(())
//! # }
//! ```
//!
//! Mutual exclusion holds as long as the store's conditional write is
//! atomic. Priority order is best effort: it relies on every competitor
//! honoring the queue. There is no revocation; a holder that stalls past its
//! TTL learns it lost the lock only by checking. Every lease carries a
//! fencing `token` that increases with each acquisition, for resources able
//! to reject writes from stale holders.

pub mod client;
pub mod config;
pub mod error;
pub mod fairness;
pub mod schema;
pub mod store;
pub mod wait;

pub use client::{Attempt, DEFAULT_PRIORITY, DEFAULT_TTL, LockClient, LockRequest};
pub use config::{StoreConfig, StoreConfigBuilder};
pub use error::{Error, Result};
pub use fairness::{DEFAULT_HEARTBEAT_TIMEOUT, Fairness, PriorityQueue, Unordered};
pub use store::memory::MemoryStore;
pub use store::spanner::SpannerStore;
pub use store::{Lease, LockTable, Store, WaitQueue, Waiter};
pub use wait::{CancelToken, PollPolicy, Wait};

/// A random owner id, for callers without a natural identity.
pub fn owner_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
