//! Redis-backed cache store
//!
//! Commands go through a cloned [`ConnectionManager`], which multiplexes a
//! single reconnecting connection. Pub/sub needs its own connection per
//! subscription, created from a dedicated client; each subscription runs a
//! forwarding task that exits when the handle is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::{mpsc, Notify};

use super::{CacheStore, StoreError, StoreResult, Subscription};

/// Default per-command timeout. No store call may block its caller
/// indefinitely; the realtime path degrades on timeout instead.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis implementation of [`CacheStore`].
pub struct RedisStore {
    conn: ConnectionManager,
    client: redis::Client,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connect to a Redis server, e.g. `redis://localhost:6379`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            conn,
            client,
            command_timeout: COMMAND_TIMEOUT,
        })
    }

    /// Override the per-command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn run<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, redis::RedisError>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(what.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.run("GET", async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run("SET", async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run("DEL", async move {
            redis::cmd("DEL").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run("EXPIRE", async move {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run("HSET", async move {
            redis::cmd("HSET")
                .arg(key)
                .arg(field)
                .arg(value)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.run("HGET", async move {
            redis::cmd("HGET")
                .arg(key)
                .arg(field)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        self.run("HGETALL", async move {
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .run("HDEL", async move {
                redis::cmd("HDEL")
                    .arg(key)
                    .arg(field)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        self.run("HEXISTS", async move {
            redis::cmd("HEXISTS")
                .arg(key)
                .arg(field)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        self.run("HLEN", async move {
            redis::cmd("HLEN").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run("ZADD", async move {
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        self.run("ZCOUNT", async move {
            redis::cmd("ZCOUNT")
                .arg(key)
                .arg(min)
                .arg(max)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        self.run("ZCARD", async move {
            redis::cmd("ZCARD").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        self.run("ZREMRANGEBYSCORE", async move {
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run("LPUSH", async move {
            redis::cmd("LPUSH")
                .arg(key)
                .arg(value)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.run("RPOP", async move {
            redis::cmd("RPOP").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.run("LRANGE", async move {
            redis::cmd("LRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        self.run("LLEN", async move {
            redis::cmd("LLEN").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        self.run("LREM", async move {
            redis::cmd("LREM")
                .arg(key)
                .arg(1)
                .arg(value)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        self.run("KEYS", async move {
            redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run("PUBLISH", async move {
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(StoreError::Redis)?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(Notify::new());
        let closed_task = Arc::clone(&closed);
        let channel_name = channel.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = closed_task.notified() => break,
                    msg = stream.next() => {
                        let Some(msg) = msg else { break };
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                log::warn!("discarding undecodable pub/sub payload on {}: {}", channel_name, e);
                                continue;
                            }
                        };
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(channel.to_string(), rx, closed))
    }
}
