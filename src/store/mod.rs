//! Cache store abstraction
//!
//! Everything the cluster shares (presence hashes, rate-limit windows,
//! content snapshots, queue structures and the pub/sub fan-out) lives
//! behind the [`CacheStore`] trait. Two backends are provided:
//!
//! - [`RedisStore`]: the production backend, one connection manager for
//!   commands plus a dedicated client for pub/sub subscriptions
//! - [`MemoryStore`]: a process-local backend for tests and single-node
//!   deployments, backed by concurrent maps and broadcast channels
//!
//! Callers must treat every read as fallible-by-miss: a cold cache degrades
//! behavior, it never fails a request.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A live pub/sub subscription to a single channel.
///
/// Messages arrive through [`Subscription::recv`]. Dropping the handle
/// unsubscribes; the backing task observes the drop and exits.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    closed: Arc<Notify>,
}

impl Subscription {
    pub(crate) fn new(
        channel: String,
        rx: mpsc::UnboundedReceiver<String>,
        closed: Arc<Notify>,
    ) -> Self {
        Self { channel, rx, closed }
    }

    /// Channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next payload, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // notify_one stores a permit, so the forwarding task sees the
        // close even if it is mid-send rather than parked on notified().
        self.closed.notify_one();
    }
}

/// Primitive operations required of the shared cache store.
///
/// The surface mirrors the Redis commands the hub relies on: keyed strings
/// with TTL, hashes, sorted sets, lists, prefix scans and pub/sub. All
/// mutation goes through these primitives; there is no client-side locking.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    // Keyed strings

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set `key` to `value` with a TTL in seconds.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    /// Refresh the TTL of an existing key (any type).
    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()>;

    // Hashes

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Delete a hash field; returns whether the field existed.
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hlen(&self, key: &str) -> StoreResult<usize>;

    // Sorted sets

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()>;

    /// Count members with score in `[min, max]`.
    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<usize>;

    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    /// Remove members with score in `[min, max]`; returns removed count.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<usize>;

    // Lists

    /// Push to the head of a list.
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Pop from the tail of a list.
    async fn rpop(&self, key: &str) -> StoreResult<Option<String>>;

    /// Range of list elements, Redis semantics (`0, -1` is the whole list).
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    async fn llen(&self, key: &str) -> StoreResult<usize>;

    /// Remove the first element equal to `value`; returns removed count.
    async fn lrem(&self, key: &str, value: &str) -> StoreResult<usize>;

    // Key scan

    /// All live keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    // Pub/sub

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;
}
