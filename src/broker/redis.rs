//! Redis broker implementation.
//!
//! The canonical distributed backend. Task records are binary blobs under
//! `bokchoy/<queue>/<task_id>`, the ready list is a Redis list, the delayed
//! set a sorted set scored by ETA nanoseconds. Record writes are pipelined
//! atomically with the list/set operation, and the hot read paths go
//! through server-side scripts preloaded by SHA at initialization.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error};

use super::{build_key, delay_key, queue_key, Broker, BrokerStats};
use crate::error::{BokchoyError, BokchoyResult};
use crate::task::now_nanos;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROMOTER_TICK: Duration = Duration::from_secs(1);

/// Atomically overwrite a record and bound its lifetime.
const SCRIPT_SETEXPIRE: &str = r#"
redis.call('SET', KEYS[1], ARGV[2])
return redis.call('PEXPIRE', KEYS[1], ARGV[1])
"#;

/// Range a sorted set by score and remove the returned members in one
/// round trip, for callers that want drain semantics.
const SCRIPT_ZPOPBYSCORE: &str = r#"
local results = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[2])
if #results > 0 then
    redis.call('ZREMRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[2])
    return results
else
    return nil
end
"#;

/// Fetch N records in one round trip, skipping keys that no longer exist.
const SCRIPT_MULTIGET: &str = r#"
local out = {}
for _, key in ipairs(KEYS) do
    local value = redis.call('GET', key)
    if value then
        out[#out + 1] = value
    end
end
return out
"#;

/// Server-side scripts, invoked by SHA after [`RedisBroker::initialize`]
/// has loaded them.
struct RedisScripts {
    set_expire: Script,
    zpop_by_score: Script,
    multi_get: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            set_expire: Script::new(SCRIPT_SETEXPIRE),
            zpop_by_score: Script::new(SCRIPT_ZPOPBYSCORE),
            multi_get: Script::new(SCRIPT_MULTIGET),
        }
    }

    fn sources() -> [(&'static str, &'static str); 3] {
        [
            ("SETEXPIRE", SCRIPT_SETEXPIRE),
            ("ZPOPBYSCORE", SCRIPT_ZPOPBYSCORE),
            ("MULTIGET", SCRIPT_MULTIGET),
        ]
    }
}

struct RedisInner {
    conn: ConnectionManager,
    info: String,
    scripts: RedisScripts,
    /// Queues whose delayed promoter is already running
    promoters: Mutex<HashSet<String>>,
}

/// Redis-backed [`Broker`].
pub struct RedisBroker {
    inner: Arc<RedisInner>,
}

impl RedisBroker {
    /// Connect to Redis at the given URL (`redis://host:port/db`).
    pub async fn new(url: &str) -> BokchoyResult<Self> {
        let client = Client::open(url)
            .map_err(|e| BokchoyError::broker(format!("invalid Redis URL '{url}'"), e))?;

        let conn = timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|e| BokchoyError::unavailable(format!("timed out connecting to '{url}'"), e))?
            .map_err(|e| BokchoyError::unavailable(format!("failed to connect to '{url}'"), e))?;

        debug!(url = %url, "connected to Redis");

        Ok(Self {
            inner: Arc::new(RedisInner {
                conn,
                info: format!("Redis broker [{url}]"),
                scripts: RedisScripts::new(),
                promoters: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Start the delayed promoter for a queue, once per queue per process.
    ///
    /// The spawned task holds only a weak handle to the broker internals,
    /// so it winds down when the broker is dropped.
    fn ensure_promoter(&self, queue: &str) {
        {
            let mut started = self.inner.promoters.lock().unwrap();
            if !started.insert(queue.to_string()) {
                return;
            }
        }

        let weak: Weak<RedisInner> = Arc::downgrade(&self.inner);
        let queue = queue.to_string();
        debug!(queue = %queue, "delayed promoter started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROMOTER_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // the immediate first tick
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = inner.promote_due(&queue).await {
                    error!(queue = %queue, error = %err, "failed to promote delayed tasks");
                }
            }
            debug!(queue = %queue, "delayed promoter stopped");
        });
    }
}

impl RedisInner {
    /// Move every delayed task with ETA <= now into the ready list.
    ///
    /// The LPUSHes (overdue tasks jump the backlog) and the range removal
    /// run in one MULTI, so a failure or crash leaves the delayed set
    /// intact for the next tick: a task may be delivered twice across the
    /// crash window, never lost.
    async fn promote_due(&self, queue: &str) -> BokchoyResult<()> {
        let now = now_nanos();
        let delay = delay_key(queue);
        let ready = queue_key(queue);
        let mut conn = self.conn.clone();

        let due: Vec<String> = conn
            .zrangebyscore(&delay, 0, now)
            .await
            .map_err(|e| {
                BokchoyError::broker(
                    format!("failed to read due delayed tasks (queue={queue}, cmd=ZRANGEBYSCORE)"),
                    e,
                )
            })?;
        if due.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for task_id in &due {
            pipe.lpush(&ready, task_id);
        }
        pipe.zrembyscore(&delay, 0, now);
        pipe.query_async::<()>(&mut conn).await.map_err(|e| {
            BokchoyError::broker(
                format!("failed to move delayed tasks to the ready list (queue={queue})"),
                e,
            )
        })?;

        debug!(queue = %queue, promoted = due.len(), "promoted delayed tasks");
        Ok(())
    }

    /// Fetch the records for a set of task ids in one round trip.
    async fn records_for(&self, queue: &str, task_ids: &[String]) -> BokchoyResult<Vec<Vec<u8>>> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.multi_get.prepare_invoke();
        for task_id in task_ids {
            invocation.key(build_key(queue, task_id));
        }

        invocation.invoke_async(&mut conn).await.map_err(|e| {
            BokchoyError::broker(
                format!(
                    "failed to fetch task records (queue={queue}, tasks={}, cmd=MULTIGET)",
                    task_ids.len()
                ),
                e,
            )
        })
    }
}

impl fmt::Display for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.info)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn initialize(&self) -> BokchoyResult<()> {
        self.ping().await?;

        let mut conn = self.inner.conn.clone();
        for (name, source) in RedisScripts::sources() {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(source)
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    BokchoyError::config(format!("failed to preload Redis script {name}: {e}"))
                })?;
            debug!(script = name, sha = %sha, "preloaded Redis script");
        }

        Ok(())
    }

    async fn ping(&self) -> BokchoyResult<()> {
        let mut conn = self.inner.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BokchoyError::unavailable("Redis ping failed", e))?;

        if pong != "PONG" {
            return Err(BokchoyError::BrokerUnavailable {
                message: format!("unexpected ping reply '{pong}'"),
                source: None,
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        task_id: &str,
        payload: &[u8],
        eta: i64,
    ) -> BokchoyResult<()> {
        let record = build_key(queue, task_id);
        let ready = queue_key(queue);
        let mut conn = self.inner.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(&record, payload);
        if eta == 0 {
            pipe.rpush(&ready, task_id);
        } else if eta <= now_nanos() {
            // Already overdue: jump the backlog.
            pipe.lpush(&ready, task_id);
        } else {
            pipe.zadd(delay_key(queue), task_id, eta);
        }

        pipe.query_async::<()>(&mut conn).await.map_err(|e| {
            BokchoyError::broker(
                format!("failed to publish task (queue={queue}, task={task_id})"),
                e,
            )
        })?;

        debug!(queue = %queue, task_id = %task_id, eta = eta, "published task");
        Ok(())
    }

    async fn consume(&self, queue: &str, max_eta: i64) -> BokchoyResult<Vec<Vec<u8>>> {
        if max_eta != 0 {
            // Delayed read; removal stays with the promoter.
            let mut conn = self.inner.conn.clone();
            let task_ids: Vec<String> = conn
                .zrangebyscore(delay_key(queue), 0, max_eta)
                .await
                .map_err(|e| {
                    BokchoyError::broker(
                        format!("failed to consume delayed tasks (queue={queue}, cmd=ZRANGEBYSCORE)"),
                        e,
                    )
                })?;
            return self.inner.records_for(queue, &task_ids).await;
        }

        self.ensure_promoter(queue);

        let mut conn = self.inner.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(queue_key(queue))
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                BokchoyError::broker(
                    format!("failed to consume tasks (queue={queue}, cmd=BLPOP)"),
                    e,
                )
            })?;

        match popped {
            Some((_, task_id)) => self.inner.records_for(queue, &[task_id]).await,
            None => Ok(Vec::new()),
        }
    }

    async fn get(&self, queue: &str, task_id: &str) -> BokchoyResult<Option<Vec<u8>>> {
        let mut conn = self.inner.conn.clone();
        conn.get(build_key(queue, task_id)).await.map_err(|e| {
            BokchoyError::broker(
                format!("failed to get task record (queue={queue}, task={task_id}, cmd=GET)"),
                e,
            )
        })
    }

    async fn set(
        &self,
        queue: &str,
        task_id: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> BokchoyResult<()> {
        let record = build_key(queue, task_id);
        let mut conn = self.inner.conn.clone();

        if ttl.is_zero() {
            conn.set::<_, _, ()>(&record, payload).await.map_err(|e| {
                BokchoyError::broker(
                    format!("failed to set task record (queue={queue}, task={task_id}, cmd=SET)"),
                    e,
                )
            })?;
            return Ok(());
        }

        self.inner
            .scripts
            .set_expire
            .prepare_invoke()
            .key(&record)
            .arg(ttl.as_millis() as i64)
            .arg(payload)
            .invoke_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                BokchoyError::broker(
                    format!("failed to set task record (queue={queue}, task={task_id}, cmd=SETEXPIRE)"),
                    e,
                )
            })
    }

    async fn delete(&self, queue: &str, task_id: &str) -> BokchoyResult<()> {
        let mut conn = self.inner.conn.clone();
        conn.del::<_, ()>(build_key(queue, task_id))
            .await
            .map_err(|e| {
                BokchoyError::broker(
                    format!("failed to delete task record (queue={queue}, task={task_id}, cmd=DEL)"),
                    e,
                )
            })
    }

    async fn list(&self, queue: &str) -> BokchoyResult<Vec<Vec<u8>>> {
        let mut conn = self.inner.conn.clone();
        let task_ids: Vec<String> = conn.lrange(queue_key(queue), 0, -1).await.map_err(|e| {
            BokchoyError::broker(
                format!("failed to list tasks (queue={queue}, cmd=LRANGE)"),
                e,
            )
        })?;
        self.inner.records_for(queue, &task_ids).await
    }

    async fn count(&self, queue: &str) -> BokchoyResult<BrokerStats> {
        let mut conn = self.inner.conn.clone();
        let (direct, delayed): (usize, usize) = redis::pipe()
            .llen(queue_key(queue))
            .zcount(delay_key(queue), "-inf", "+inf")
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                BokchoyError::broker(
                    format!("failed to count tasks (queue={queue}, cmd=LLEN/ZCOUNT)"),
                    e,
                )
            })?;

        Ok(BrokerStats {
            direct,
            delayed,
            total: direct + delayed,
        })
    }

    async fn empty(&self, queue: &str) -> BokchoyResult<()> {
        let mut conn = self.inner.conn.clone();
        conn.del::<_, ()>(queue_key(queue)).await.map_err(|e| {
            BokchoyError::broker(
                format!("failed to empty queue (queue={queue}, cmd=DEL)"),
                e,
            )
        })
    }

    async fn clear_all(&self) -> BokchoyResult<()> {
        let mut conn = self.inner.conn.clone();
        let pattern = format!("{}*", super::KEY_PREFIX);

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    BokchoyError::broker("failed to scan broker namespace (cmd=SCAN)", e)
                })?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if keys.is_empty() {
            return Ok(());
        }

        conn.del::<_, ()>(keys).await.map_err(|e| {
            BokchoyError::broker("failed to clear broker namespace (cmd=DEL)", e)
        })
    }
}
