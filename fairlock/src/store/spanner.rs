use super::{Lease, LockTable, WaitQueue, Waiter, millis};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use google_cloud_spanner::client::{Client, ClientConfig, Error as SpannerError};
use google_cloud_spanner::mutation::insert_or_update;
use google_cloud_spanner::statement::Statement;
use google_cloud_spanner::transaction_rw::ReadWriteTransaction;
use google_cloud_spanner::value::CommitTimestamp;
use log::*;
use std::future::Future;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::runtime::Runtime;

type Job<C> = Box<dyn FnOnce(&Runtime, &C) + Send>;

enum StoreCtrl<C> {
    Exit,
    Call(Job<C>),
}

/// Query text for one pair of tables. All time comparisons use Spanner's
/// `CURRENT_TIMESTAMP()`, never the caller's clock.
#[derive(Debug)]
struct Sql {
    locks: String,
    probe: String,
    refresh: String,
    lease: String,
    release: String,
    status: String,
    touch: String,
    enqueue: String,
    position: String,
    head: String,
    heartbeat: String,
    evict: String,
    dequeue: String,
    verify: [String; 2],
}

impl Sql {
    fn new(locks: &str, queue: &str) -> Sql {
        let fresh = "heartbeat_at >= timestamp_sub(current_timestamp(), interval @stale millisecond)";
        Sql {
            locks: locks.to_string(),
            probe: format!(
                "select timestamp_add(current_timestamp(), interval @ttl millisecond) as next_expiry, \
                 (select expires_at > current_timestamp() from {locks} where name = @name) as live"
            ),
            refresh: format!(
                "update {locks} \
                 set expires_at = greatest(expires_at, timestamp_add(current_timestamp(), interval @ttl millisecond)) \
                 where name = @name and owner = @owner and expires_at > current_timestamp()"
            ),
            lease: format!("select expires_at, token from {locks} where name = @name"),
            release: format!("delete from {locks} where name = @name and owner = @owner"),
            status: format!(
                "select expires_at, token from {locks} \
                 where name = @name and owner = @owner and expires_at > current_timestamp()"
            ),
            touch: format!(
                "update {queue} set priority = @priority, heartbeat_at = current_timestamp() \
                 where lock_name = @name and owner = @owner"
            ),
            enqueue: format!(
                "insert into {queue} (lock_name, owner, priority, requested_at, heartbeat_at) \
                 values (@name, @owner, @priority, current_timestamp(), current_timestamp())"
            ),
            position: format!(
                "select count(1) + 1 as position \
                 from {queue} as q, \
                 (select priority, requested_at from {queue} where lock_name = @name and owner = @owner) as me \
                 where q.lock_name = @name and q.owner != @owner and q.{fresh} \
                 and (q.priority > me.priority \
                 or (q.priority = me.priority and q.requested_at < me.requested_at) \
                 or (q.priority = me.priority and q.requested_at = me.requested_at and q.owner < @owner))"
            ),
            head: format!(
                "select owner, priority, requested_at from {queue} \
                 where lock_name = @name and {fresh} \
                 order by priority desc, requested_at asc, owner asc limit 1"
            ),
            heartbeat: format!(
                "update {queue} set heartbeat_at = current_timestamp() \
                 where lock_name = @name and owner = @owner"
            ),
            evict: format!(
                "delete from {queue} where lock_name = @name \
                 and heartbeat_at < timestamp_sub(current_timestamp(), interval @stale millisecond)"
            ),
            dequeue: format!("delete from {queue} where lock_name = @name and owner = @owner"),
            verify: [
                format!("select count(1) as n from {locks} where name = ''"),
                format!("select count(1) as n from {queue} where lock_name = ''"),
            ],
        }
    }
}

fn stmt(sql: &str, params: &[(&str, &Param)]) -> Statement {
    let mut stmt = Statement::new(sql);
    for (key, param) in params {
        match param {
            Param::Str(v) => stmt.add_param(key, v),
            Param::Int(v) => stmt.add_param(key, v),
        }
    }

    stmt
}

enum Param {
    Str(String),
    Int(i64),
}

fn commit_nanos(seconds: i64, nanos: i32) -> i128 {
    i128::from(seconds) * 1_000_000_000 + i128::from(nanos)
}

async fn probe_and_claim(
    tx: &mut ReadWriteTransaction,
    sql: &Sql,
    name: &str,
    owner: &str,
    priority: i64,
    ttl_ms: i64,
) -> std::result::Result<Option<OffsetDateTime>, SpannerError> {
    let (live, next_expiry) = {
        let mut iter = tx
            .query(stmt(
                &sql.probe,
                &[
                    ("name", &Param::Str(name.to_string())),
                    ("ttl", &Param::Int(ttl_ms)),
                ],
            ))
            .await?;
        match iter.next().await? {
            Some(row) => (
                row.column_by_name::<Option<bool>>("live")?,
                row.column_by_name::<OffsetDateTime>("next_expiry")?,
            ),
            None => return Ok(None),
        }
    };

    if live == Some(true) {
        return Ok(None);
    }

    // The token column takes the commit timestamp, which Spanner guarantees
    // to increase across transactions touching the same row.
    tx.buffer_write(vec![insert_or_update(
        &sql.locks,
        &["name", "owner", "priority", "expires_at", "token"],
        &[
            &name.to_string(),
            &owner.to_string(),
            &priority,
            &next_expiry,
            &CommitTimestamp::new(),
        ],
    )]);

    Ok(Some(next_expiry))
}

async fn extend(
    tx: &mut ReadWriteTransaction,
    sql: &Sql,
    name: &str,
    owner: &str,
    ttl_ms: i64,
) -> std::result::Result<Option<Lease>, SpannerError> {
    let updated = tx
        .update(stmt(
            &sql.refresh,
            &[
                ("name", &Param::Str(name.to_string())),
                ("owner", &Param::Str(owner.to_string())),
                ("ttl", &Param::Int(ttl_ms)),
            ],
        ))
        .await?;
    if updated == 0 {
        return Ok(None);
    }

    let mut iter = tx
        .query(stmt(&sql.lease, &[("name", &Param::Str(name.to_string()))]))
        .await?;
    match iter.next().await? {
        Some(row) => {
            let expires_at = row.column_by_name::<OffsetDateTime>("expires_at")?;
            let token = row.column_by_name::<CommitTimestamp>("token")?;
            Ok(Some(Lease {
                expires_at,
                token: token.unix_timestamp_nanos(),
            }))
        }
        None => Ok(None),
    }
}

/// Runs a single DML statement in its own read-write transaction and
/// returns the affected row count.
async fn exec<F>(client: &Client, build: F) -> std::result::Result<i64, SpannerError>
where
    F: Fn() -> Statement + Send + Sync,
{
    let (_, rows) = client
        .read_write_transaction(|tx| {
            let stmt = build();
            Box::pin(async move { tx.update(stmt).await.map_err(SpannerError::from) })
        })
        .await?;

    Ok(rows)
}

/// Wraps `f` into a job that runs as its own task on the worker's runtime
/// and sends its output to `tx`.
fn spawn_job<C, F, Fut>(op: &'static str, f: F, tx: Sender<Fut::Output>) -> Job<C>
where
    C: Clone + Send + 'static,
    F: FnOnce(C) -> Fut + Send + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    Box::new(move |rt: &Runtime, client: &C| {
        let client = client.clone();
        rt.spawn(async move {
            let start = Instant::now();
            let res = f(client).await;
            debug!("{op} took {:?}", start.elapsed());
            let _ = tx.send(res);
        });
    })
}

/// Dispatches jobs until `Exit` or until every sender is gone. Jobs run
/// concurrently; in-flight ones are dropped with the runtime.
fn serve<C>(rt: &Runtime, client: &C, rx_ctrl: Receiver<StoreCtrl<C>>) {
    for code in rx_ctrl {
        match code {
            StoreCtrl::Exit => break,
            StoreCtrl::Call(job) => job(rt, client),
        }
    }
}

fn spanner_caller(
    cfg: StoreConfig,
    rx_ctrl: Receiver<StoreCtrl<Client>>,
    tx_ready: Sender<anyhow::Result<()>>,
) {
    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = tx_ready.send(Err(e.into()));
            return;
        }
    };

    let client = match rt.block_on(new_client(&cfg)) {
        Ok(client) => client,
        Err(e) => {
            let _ = tx_ready.send(Err(e));
            return;
        }
    };

    info!(
        "connected: db={}, sessions={}..{}",
        cfg.database, cfg.min_sessions, cfg.max_sessions
    );

    let _ = tx_ready.send(Ok(()));
    serve(&rt, &client, rx_ctrl);

    rt.block_on(client.close());
    info!("spanner caller exited");
}

async fn new_client(cfg: &StoreConfig) -> anyhow::Result<Client> {
    let mut config = ClientConfig::default().with_auth().await?;
    config.session_config.min_opened = cfg.min_sessions;
    config.session_config.max_opened = cfg.max_sessions;
    Ok(Client::new(cfg.database.clone(), config).await?)
}

/// A [`Store`](super::Store) backed by two Cloud Spanner tables.
///
/// The async Spanner client lives on a dedicated thread with its own tokio
/// runtime; every primitive is shipped there and runs as its own task, so
/// callers on different threads share the session pool concurrently. The
/// calling thread blocks on the reply, which keeps the lock API synchronous.
pub struct SpannerStore {
    sql: Arc<Sql>,
    ctrl: Sender<StoreCtrl<Client>>,
    worker: Option<JoinHandle<()>>,
}

impl SpannerStore {
    /// Connects using `cfg`. Fails if the runtime or the client session pool
    /// cannot be created.
    pub fn connect(cfg: StoreConfig) -> Result<SpannerStore> {
        cfg.validate()?;
        let sql = Arc::new(Sql::new(&cfg.locks_table, &cfg.queue_table));
        let (tx_ctrl, rx_ctrl) = mpsc::channel();
        let (tx_ready, rx_ready) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("fairlock-spanner".to_string())
            .spawn(move || spanner_caller(cfg, rx_ctrl, tx_ready))
            .map_err(|e| Error::Store(e.into()))?;

        match rx_ready.recv() {
            Ok(Ok(())) => Ok(SpannerStore {
                sql,
                ctrl: tx_ctrl,
                worker: Some(worker),
            }),
            Ok(Err(e)) => Err(Error::Store(e.context("spanner connect"))),
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Checks that both tables exist and are readable.
    pub fn verify_schema(&self) -> Result<()> {
        let sql = self.sql.clone();
        self.call("verify_schema", move |client| async move {
            let mut tx = client.single().await?;
            for q in &sql.verify {
                let mut iter = tx.query(Statement::new(q.as_str())).await?;
                while iter.next().await?.is_some() {}
            }

            Ok(())
        })
    }

    pub fn close(&mut self) {
        if let Err(e) = self.ctrl.send(StoreCtrl::Exit) {
            debug!("StoreCtrl::Exit failed: {e}");
        }

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("spanner caller panicked");
            }
        }
    }

    fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Client) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, SpannerError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.ctrl
            .send(StoreCtrl::Call(spawn_job(op, f, tx)))
            .map_err(|_| Error::Disconnected)?;

        match rx.recv() {
            Ok(res) => res.map_err(|e| Error::Store(anyhow::Error::new(e).context(op))),
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Single DML round-trip keyed by lock name and owner.
    fn exec_owned(
        &self,
        op: &'static str,
        q: fn(&Sql) -> &String,
        name: &str,
        owner: &str,
    ) -> Result<i64> {
        let sql = self.sql.clone();
        let (name, owner) = (name.to_string(), owner.to_string());
        self.call(op, move |client| async move {
            exec(&client, || {
                stmt(
                    q(&sql),
                    &[
                        ("name", &Param::Str(name.clone())),
                        ("owner", &Param::Str(owner.clone())),
                    ],
                )
            })
            .await
        })
    }
}

impl Drop for SpannerStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl LockTable for SpannerStore {
    fn acquire(
        &self,
        name: &str,
        owner: &str,
        priority: i64,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let sql = self.sql.clone();
        let (name, owner, ttl_ms) = (name.to_string(), owner.to_string(), millis(ttl));
        self.call("acquire", move |client| async move {
            let (ts, expires_at) = client
                .read_write_transaction(|tx| {
                    let (sql, name, owner) = (sql.clone(), name.clone(), owner.clone());
                    Box::pin(async move {
                        probe_and_claim(tx, &sql, &name, &owner, priority, ttl_ms).await
                    })
                })
                .await?;

            Ok(match (expires_at, ts.timestamp) {
                (Some(expires_at), Some(ts)) => Some(Lease {
                    expires_at,
                    token: commit_nanos(ts.seconds, ts.nanos),
                }),
                _ => None,
            })
        })
    }

    fn refresh(&self, name: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>> {
        let sql = self.sql.clone();
        let (name, owner, ttl_ms) = (name.to_string(), owner.to_string(), millis(ttl));
        self.call("refresh", move |client| async move {
            let (_, lease) = client
                .read_write_transaction(|tx| {
                    let (sql, name, owner) = (sql.clone(), name.clone(), owner.clone());
                    Box::pin(async move { extend(tx, &sql, &name, &owner, ttl_ms).await })
                })
                .await?;

            Ok(lease)
        })
    }

    fn release(&self, name: &str, owner: &str) -> Result<bool> {
        Ok(self.exec_owned("release", |s| &s.release, name, owner)? > 0)
    }

    fn status(&self, name: &str, owner: &str) -> Result<Option<Lease>> {
        let sql = self.sql.clone();
        let (name, owner) = (name.to_string(), owner.to_string());
        self.call("status", move |client| async move {
            let mut tx = client.single().await?;
            let mut iter = tx
                .query(stmt(
                    &sql.status,
                    &[("name", &Param::Str(name)), ("owner", &Param::Str(owner))],
                ))
                .await?;
            let lease = match iter.next().await? {
                Some(row) => {
                    let expires_at = row.column_by_name::<OffsetDateTime>("expires_at")?;
                    let token = row.column_by_name::<CommitTimestamp>("token")?;
                    Some(Lease {
                        expires_at,
                        token: token.unix_timestamp_nanos(),
                    })
                }
                None => None,
            };

            Ok(lease)
        })
    }
}

impl WaitQueue for SpannerStore {
    fn enqueue(&self, name: &str, owner: &str, priority: i64) -> Result<()> {
        let sql = self.sql.clone();
        let (name, owner) = (name.to_string(), owner.to_string());
        self.call("enqueue", move |client| async move {
            client
                .read_write_transaction(|tx| {
                    let params = [
                        ("name", Param::Str(name.clone())),
                        ("owner", Param::Str(owner.clone())),
                        ("priority", Param::Int(priority)),
                    ];
                    let sql = sql.clone();
                    Box::pin(async move {
                        let params: Vec<_> = params.iter().map(|(k, v)| (*k, v)).collect();
                        // Keep requested_at on existing entries; only new ones get
                        // an arrival time.
                        if tx.update(stmt(&sql.touch, &params)).await? == 0 {
                            tx.update(stmt(&sql.enqueue, &params)).await?;
                        }

                        Ok::<_, SpannerError>(())
                    })
                })
                .await?;

            Ok(())
        })
    }

    fn position(&self, name: &str, owner: &str, stale_after: Duration) -> Result<u64> {
        let sql = self.sql.clone();
        let (name, owner, stale_ms) = (name.to_string(), owner.to_string(), millis(stale_after));
        self.call("position", move |client| async move {
            let mut tx = client.single().await?;
            let mut iter = tx
                .query(stmt(
                    &sql.position,
                    &[
                        ("name", &Param::Str(name)),
                        ("owner", &Param::Str(owner)),
                        ("stale", &Param::Int(stale_ms)),
                    ],
                ))
                .await?;
            let position = match iter.next().await? {
                Some(row) => row.column_by_name::<i64>("position")?,
                None => 1,
            };

            Ok(u64::try_from(position).unwrap_or(1))
        })
    }

    fn head(&self, name: &str, stale_after: Duration) -> Result<Option<Waiter>> {
        let sql = self.sql.clone();
        let (name, stale_ms) = (name.to_string(), millis(stale_after));
        self.call("head", move |client| async move {
            let mut tx = client.single().await?;
            let mut iter = tx
                .query(stmt(
                    &sql.head,
                    &[("name", &Param::Str(name)), ("stale", &Param::Int(stale_ms))],
                ))
                .await?;
            let head = match iter.next().await? {
                Some(row) => Some(Waiter {
                    owner: row.column_by_name::<String>("owner")?,
                    priority: row.column_by_name::<i64>("priority")?,
                    requested_at: row.column_by_name::<OffsetDateTime>("requested_at")?,
                }),
                None => None,
            };

            Ok(head)
        })
    }

    fn heartbeat(&self, name: &str, owner: &str) -> Result<bool> {
        Ok(self.exec_owned("heartbeat", |s| &s.heartbeat, name, owner)? > 0)
    }

    fn evict_stale(&self, name: &str, stale_after: Duration) -> Result<u64> {
        let sql = self.sql.clone();
        let (name, stale_ms) = (name.to_string(), millis(stale_after));
        let evicted = self.call("evict_stale", move |client| async move {
            exec(&client, || {
                stmt(
                    &sql.evict,
                    &[
                        ("name", &Param::Str(name.clone())),
                        ("stale", &Param::Int(stale_ms)),
                    ],
                )
            })
            .await
        })?;

        Ok(u64::try_from(evicted).unwrap_or(0))
    }

    fn dequeue(&self, name: &str, owner: &str) -> Result<bool> {
        Ok(self.exec_owned("dequeue", |s| &s.dequeue, name, owner)? > 0)
    }
}
