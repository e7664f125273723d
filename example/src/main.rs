use anyhow::{Context, bail};
use fairlock_rs::*;
use log::{error, info, warn};
use std::env;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("memory");

    let cancel = CancelToken::new();
    let c = cancel.clone();
    ctrlc::set_handler(move || c.cancel()).context("set ctrl-c handler")?;

    match mode {
        "ddl" => {
            let cfg = StoreConfig::from_env()?;
            for stmt in schema::ddl(&cfg.locks_table, &cfg.queue_table) {
                println!("{stmt};\n");
            }

            Ok(())
        }
        "memory" => run(Arc::new(MemoryStore::new()), &cancel),
        "spanner" => {
            let store = SpannerStore::connect(StoreConfig::from_env()?)?;
            store
                .verify_schema()
                .context("lock tables not found, apply the output of `example ddl` first")?;
            run(Arc::new(store), &cancel)
        }
        other => bail!("unknown mode {other:?}, expected memory, spanner or ddl"),
    }
}

fn run<S: Store + 'static>(store: Arc<S>, cancel: &CancelToken) -> anyhow::Result<()> {
    priority_demo(Arc::new(LockClient::fair(store.clone())), cancel);
    if cancel.is_cancelled() {
        return Ok(());
    }

    takeover_demo(Arc::new(LockClient::plain(store)), cancel)
}

/// Holds the lock for `work`, re-validating every `check_every`. Returns
/// false as soon as the lease is found lost.
fn hold<S: Store, F: Fairness>(
    client: &LockClient<S, F>,
    req: &LockRequest,
    work: Duration,
    check_every: Duration,
) -> Result<bool> {
    let start = Instant::now();
    while start.elapsed() < work {
        thread::sleep(check_every.min(work.saturating_sub(start.elapsed())));
        match client.check_lock_status(&req.name, &req.owner)? {
            Some(lease) => info!("[{}] still valid until {}", req.owner, lease.expires_at),
            None => {
                warn!("[{}] lease lost, stopping work", req.owner);
                return Ok(false);
            }
        }
    }

    Ok(true)
}

fn priority_demo<S: Store + 'static>(client: Arc<LockClient<S>>, cancel: &CancelToken) {
    info!("priority demo: higher priority waiters should acquire first");

    // (id, priority, start delay)
    let workers = [
        (1, 1, 0),
        (2, 5, 100),
        (3, 10, 200),
        (4, 1, 300),
        (5, 10, 400),
        (6, 5, 500),
    ];

    let handles: Vec<_> = workers
        .into_iter()
        .map(|(id, priority, delay)| {
            let client = client.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay));
                let owner = format!("worker-{id}-p{priority}");
                let req = LockRequest::new("priority-resource", owner)
                    .priority(priority)
                    .ttl(Duration::from_secs(4));
                if let Err(e) = priority_worker(&client, &req, &cancel) {
                    error!("[{}] {e}", req.owner);
                }
            })
        })
        .collect();

    for h in handles {
        if h.join().is_err() {
            error!("worker panicked");
        }
    }

    info!("priority demo done: worker 1 first, then 3 and 5, then 2 and 6, then 4");
}

fn priority_worker<S: Store>(
    client: &LockClient<S>,
    req: &LockRequest,
    cancel: &CancelToken,
) -> Result<()> {
    let start = Instant::now();
    let wait = Wait::every(Duration::from_millis(300)).cancel(cancel.clone());
    let lease = client.lock(req, &wait)?;
    info!(
        "[{}] acquired after {:?}, expires at {}",
        req.owner,
        start.elapsed(),
        lease.expires_at
    );

    hold(client, req, Duration::from_secs(2), Duration::from_secs(1))?;
    if client.unlock(&req.name, &req.owner)? {
        info!("[{}] released", req.owner);
    }

    Ok(())
}

fn takeover_demo<S: Store + 'static>(
    client: Arc<LockClient<S, Unordered>>,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    info!("takeover demo: a stalled holder loses its lease");
    const NAME: &str = "timeout-demo-resource";

    let slow = LockRequest::new(NAME, "worker-A-slow").ttl(Duration::from_secs(3));
    let Attempt::Acquired(lease) = client.try_lock(&slow)? else {
        bail!("[{}] could not acquire a free lock", slow.owner);
    };
    info!(
        "[{}] acquired until {}, now stalling",
        slow.owner, lease.expires_at
    );

    let c = client.clone();
    let wait = Wait::every(Duration::from_millis(500)).cancel(cancel.clone());
    let taker = thread::spawn(move || -> Result<()> {
        let req = LockRequest::new(NAME, "worker-B-takeover").ttl(Duration::from_secs(5));
        let lease = c.lock(&req, &wait)?;
        info!(
            "[{}] took over, expires at {}, token {}",
            req.owner, lease.expires_at, lease.token
        );
        if c.check_lock_status(NAME, "worker-A-slow")?.is_none() {
            info!("[{}] confirmed worker-A-slow lost the lock", req.owner);
        }

        thread::sleep(Duration::from_secs(2));
        if c.release_lock(NAME, &req.owner)? {
            info!("[{}] released", req.owner);
        }

        Ok(())
    });

    for sec in 1..=5 {
        thread::sleep(Duration::from_secs(1));
        match client.check_lock_status(NAME, &slow.owner) {
            Ok(Some(lease)) => info!(
                "[{}] second {sec}: still valid until {}",
                slow.owner, lease.expires_at
            ),
            Ok(None) => {
                warn!("[{}] second {sec}: lease gone, stopping", slow.owner);
                break;
            }
            Err(e) => warn!("[{}] status check failed: {e}", slow.owner),
        }
    }

    match taker.join() {
        Ok(res) => res?,
        Err(_) => bail!("takeover worker panicked"),
    }

    info!("takeover demo done: holders must re-check or refresh within the TTL");
    Ok(())
}
