//! Queue Client (C1, §4.1, §6.1).
//!
//! A thin, async wrapper over Redis. Connection-level transient failures
//! are absorbed by `redis::aio::ConnectionManager`'s own reconnect logic
//! (mirroring the teacher's `connect_with_backoff`, just pushed down into
//! the client the crate already depends on); command-level failures get one
//! capped-backoff retry loop on top of that, and anything still failing
//! after the cap is surfaced as fatal to the caller, per §4.1.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

const MAX_RETRIES: u32 = 5;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5_000;

#[derive(Clone)]
pub struct QueueClient {
    conn: ConnectionManager,
}

impl QueueClient {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    /// Retry a fallible Redis operation with capped exponential backoff.
    /// Used internally by every method below so transient errors never
    /// bubble straight to the caller.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut delay = Duration::from_millis(INITIAL_BACKOFF_MS);
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            match op(self.conn.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt == MAX_RETRIES {
                        last_err = Some(e);
                        break;
                    }
                    warn!(attempt, err = %e, delay_ms = delay.as_millis(), "redis op retry");
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_millis(MAX_BACKOFF_MS));
                    last_err = Some(e);
                }
            }
        }
        Err(anyhow::anyhow!(
            "redis operation failed after {MAX_RETRIES} retries: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    /// Atomic multi-queue blocking pop (§4.1): block up to `timeout`,
    /// popping from the first non-empty queue among `queues` (declared
    /// order). Returns `None` on timeout without raising.
    pub async fn blocking_pop_multi(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, String)>> {
        if queues.is_empty() {
            // Nothing to block on; sleep out the timeout to avoid a busy loop.
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        let timeout_secs = timeout.as_secs_f64().max(0.001);
        let result: Option<(String, String)> = self
            .with_retry(|mut conn| {
                let queues = queues.to_vec();
                async move { conn.blpop(&queues, timeout_secs).await }
            })
            .await?;
        Ok(result)
    }

    /// Right-push a value onto a queue (producer side, §6.1).
    pub async fn push_right(&self, queue: &str, value: &str) -> anyhow::Result<()> {
        self.with_retry(|mut conn| {
            let queue = queue.to_string();
            let value = value.to_string();
            async move { conn.rpush::<_, _, ()>(queue, value).await }
        })
        .await
    }

    /// Left-push a value onto a queue (used to re-enqueue in-flight items
    /// at the head on graceful shutdown, §4.5 step 3).
    pub async fn push_left(&self, queue: &str, value: &str) -> anyhow::Result<()> {
        self.with_retry(|mut conn| {
            let queue = queue.to_string();
            let value = value.to_string();
            async move { conn.lpush::<_, _, ()>(queue, value).await }
        })
        .await
    }

    pub async fn list_len(&self, queue: &str) -> anyhow::Result<usize> {
        self.with_retry(|mut conn| {
            let queue = queue.to_string();
            async move { conn.llen(queue).await }
        })
        .await
    }

    /// Move up to `count` items from the tail of `src` to the tail of `dst`
    /// (used by DLQ reprocessing, §4.8: "move... back to the tail of
    /// `<queue>`"). Uses `LMOVE src dst RIGHT RIGHT` rather than
    /// `RPOPLPUSH`, which pushes onto `dst`'s head — that would let
    /// reprocessed items jump ahead of anything already queued.
    pub async fn move_tail_to_tail(
        &self,
        src: &str,
        dst: &str,
        count: usize,
    ) -> anyhow::Result<usize> {
        let mut moved = 0;
        for _ in 0..count {
            let value: Option<String> = self
                .with_retry(|mut conn| {
                    let src = src.to_string();
                    let dst = dst.to_string();
                    async move {
                        conn.lmove(src, dst, redis::Direction::Right, redis::Direction::Right)
                            .await
                    }
                })
                .await?;
            if value.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    /// Read a bounded slice of a list's current contents (used by DLQ
    /// `list`, §4.8).
    pub async fn list_range(
        &self,
        queue: &str,
        start: isize,
        stop: isize,
    ) -> anyhow::Result<Vec<String>> {
        self.with_retry(|mut conn| {
            let queue = queue.to_string();
            async move { conn.lrange(queue, start, stop).await }
        })
        .await
    }

    /// Remove the first occurrence of `value` from `queue` (used by DLQ
    /// `purge`, §4.8).
    pub async fn list_remove(&self, queue: &str, value: &str) -> anyhow::Result<usize> {
        self.with_retry(|mut conn| {
            let queue = queue.to_string();
            let value = value.to_string();
            async move { conn.lrem(queue, 1, value).await }
        })
        .await
    }

    /// Set a JSON-serializable value at `key` with a TTL.
    pub async fn set_json_ex<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_string(value)?;
        let ttl_secs = ttl.as_secs().max(1);
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let payload = payload.clone();
            async move { conn.set_ex::<_, _, ()>(key, payload, ttl_secs).await }
        })
        .await
    }

    /// Get and deserialize a JSON value at `key`. Returns `None` if absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let raw: Option<String> = self
            .with_retry(|mut conn| {
                let key = key.to_string();
                async move { conn.get(key).await }
            })
            .await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Extend the TTL of an existing key without rewriting its value (used
    /// when moving an item to the DLQ, §4.4). A zero `ttl` means "disable
    /// expiry" (§4.2's DLQ TTL policy: "0 disables DLQ expiry") and is
    /// realized as `PERSIST` rather than clamped to a 1-second expiry.
    pub async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        if ttl.is_zero() {
            return self.persist(key).await;
        }
        let ttl_secs = ttl.as_secs() as i64;
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.expire(key, ttl_secs).await }
        })
        .await
    }

    /// Remove any TTL on `key`, leaving it to persist indefinitely.
    pub async fn persist(&self, key: &str) -> anyhow::Result<bool> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.persist(key).await }
        })
        .await
    }

    pub async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.del::<_, ()>(key).await }
        })
        .await
    }

    pub async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.exists(key).await }
        })
        .await
    }

    /// Insert/update a member's score in a sorted set (`ZADD`), used for the
    /// `vcons` timestamp index (§3, §4.2).
    pub async fn zadd(&self, key: &str, member: &str, score: i64) -> anyhow::Result<()> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.zadd::<_, _, _, ()>(key, member, score).await }
        })
        .await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.zrem::<_, _, ()>(key, member).await }
        })
        .await
    }

    /// `ZRANGEBYSCORE`, used by `list_by_time` (§6.2).
    pub async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> anyhow::Result<Vec<String>> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.zrangebyscore(key, min, max).await }
        })
        .await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.sadd::<_, _, ()>(key, member).await }
        })
        .await
    }

    pub async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.srem::<_, _, ()>(key, member).await }
        })
        .await
    }

    pub async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.smembers(key).await }
        })
        .await
    }

    /// `SCAN` for keys matching a pattern (maintenance operations, §4.1).
    pub async fn scan_match(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(pattern)
            .await
            .map_err(|e| anyhow::anyhow!("scan failed: {e}"))?;
        let mut out = Vec::new();
        while let Some(key) = futures::StreamExt::next(&mut iter).await {
            out.push(key);
        }
        Ok(out)
    }
}
