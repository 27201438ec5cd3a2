//! In-process cache store
//!
//! Backs the full [`CacheStore`] surface with concurrent maps and broadcast
//! channels. Used by the test suite and by single-node deployments that run
//! without Redis; the cluster-shared semantics collapse to process-local
//! ones but every code path stays identical.
//!
//! TTLs are enforced lazily: an expired entry is evicted the next time any
//! operation touches its key or a prefix scan walks past it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Notify};

use super::{CacheStore, StoreResult, Subscription};

/// Broadcast buffer per channel; slow subscribers skip, they do not block.
const CHANNEL_CAPACITY: usize = 256;

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn with_ttl(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// Process-local implementation of [`CacheStore`].
#[derive(Default)]
pub struct MemoryStore {
    kv: DashMap<String, Entry<String>>,
    hashes: DashMap<String, Entry<HashMap<String, String>>>,
    zsets: DashMap<String, Entry<HashMap<String, f64>>>,
    lists: DashMap<String, Entry<VecDeque<String>>>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge<T>(map: &DashMap<String, Entry<T>>, key: &str) {
        if map.get(key).map(|e| e.expired()).unwrap_or(false) {
            map.remove(key);
        }
    }

    fn purge_key(&self, key: &str) {
        Self::purge(&self.kv, key);
        Self::purge(&self.hashes, key);
        Self::purge(&self.zsets, key);
        Self::purge(&self.lists, key);
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Self::purge(&self.kv, key);
        Ok(self.kv.get(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        self.kv.insert(
            key.to_string(),
            Entry::with_ttl(value.to_string(), Duration::from_secs(ttl_secs)),
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.kv.remove(key);
        self.hashes.remove(key);
        self.zsets.remove(key);
        self.lists.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        self.purge_key(key);
        let at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        if let Some(mut e) = self.kv.get_mut(key) {
            e.expires_at = at;
        }
        if let Some(mut e) = self.hashes.get_mut(key) {
            e.expires_at = at;
        }
        if let Some(mut e) = self.zsets.get_mut(key) {
            e.expires_at = at;
        }
        if let Some(mut e) = self.lists.get_mut(key) {
            e.expires_at = at;
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        Self::purge(&self.hashes, key);
        self.hashes
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(HashMap::new()))
            .value
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Self::purge(&self.hashes, key);
        Ok(self
            .hashes
            .get(key)
            .and_then(|e| e.value.get(field).cloned()))
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Self::purge(&self.hashes, key);
        Ok(self
            .hashes
            .get(key)
            .map(|e| e.value.clone())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        Self::purge(&self.hashes, key);
        let removed = self
            .hashes
            .get_mut(key)
            .map(|mut e| e.value.remove(field).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        Self::purge(&self.hashes, key);
        Ok(self
            .hashes
            .get(key)
            .map(|e| e.value.contains_key(field))
            .unwrap_or(false))
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        Self::purge(&self.hashes, key);
        Ok(self.hashes.get(key).map(|e| e.value.len()).unwrap_or(0))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        Self::purge(&self.zsets, key);
        self.zsets
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(HashMap::new()))
            .value
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<usize> {
        Self::purge(&self.zsets, key);
        Ok(self
            .zsets
            .get(key)
            .map(|e| {
                e.value
                    .values()
                    .filter(|&&score| score >= min && score <= max)
                    .count()
            })
            .unwrap_or(0))
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        Self::purge(&self.zsets, key);
        Ok(self.zsets.get(key).map(|e| e.value.len()).unwrap_or(0))
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<usize> {
        Self::purge(&self.zsets, key);
        let mut removed = 0;
        if let Some(mut e) = self.zsets.get_mut(key) {
            let before = e.value.len();
            e.value.retain(|_, &mut score| score < min || score > max);
            removed = before - e.value.len();
        }
        Ok(removed)
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<()> {
        Self::purge(&self.lists, key);
        self.lists
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(VecDeque::new()))
            .value
            .push_front(value.to_string());
        Ok(())
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        Self::purge(&self.lists, key);
        Ok(self
            .lists
            .get_mut(key)
            .and_then(|mut e| e.value.pop_back()))
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        Self::purge(&self.lists, key);
        let Some(e) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = e.value.len() as isize;
        let resolve = |idx: isize| -> isize {
            if idx < 0 {
                (len + idx).max(0)
            } else {
                idx
            }
        };
        let start = resolve(start);
        let stop = resolve(stop).min(len - 1);
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(e.value
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        Self::purge(&self.lists, key);
        Ok(self.lists.get(key).map(|e| e.value.len()).unwrap_or(0))
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<usize> {
        Self::purge(&self.lists, key);
        let mut removed = 0;
        if let Some(mut e) = self.lists.get_mut(key) {
            if let Some(pos) = e.value.iter().position(|v| v == value) {
                e.value.remove(pos);
                removed = 1;
            }
        }
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        for map_keys in [
            self.kv
                .iter()
                .filter(|e| !e.value().expired())
                .map(|e| e.key().clone())
                .collect::<Vec<_>>(),
            self.hashes
                .iter()
                .filter(|e| !e.value().expired())
                .map(|e| e.key().clone())
                .collect(),
            self.zsets
                .iter()
                .filter(|e| !e.value().expired())
                .map(|e| e.key().clone())
                .collect(),
            self.lists
                .iter()
                .filter(|e| !e.value().expired())
                .map(|e| e.key().clone())
                .collect(),
        ] {
            keys.extend(map_keys.into_iter().filter(|k| k.starts_with(prefix)));
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        if let Some(sender) = self.channels.get(channel) {
            // No subscribers is fine; pub/sub has no persistence.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(Notify::new());
        let closed_task = Arc::clone(&closed);
        let channel_name = channel.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_task.notified() => break,
                    msg = source.recv() => match msg {
                        Ok(payload) => {
                            if tx.send(payload).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("subscriber lagged on {}, skipped {} messages", channel_name, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(Subscription::new(channel.to_string(), rx, closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kv_roundtrip_and_ttl() {
        let store = MemoryStore::new();

        store.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();

        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();

        assert_eq!(store.hget("h", "a").await.unwrap(), Some("1".to_string()));
        assert!(store.hexists("h", "b").await.unwrap());
        assert_eq!(store.hlen("h").await.unwrap(), 2);

        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());
        assert_eq!(store.hlen("h").await.unwrap(), 1);

        let all = store.hget_all("h").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all.get("b"), Some(&"2".to_string()));
    }

    #[tokio::test]
    async fn test_sorted_set_window() {
        let store = MemoryStore::new();

        store.zadd("z", 100.0, "a").await.unwrap();
        store.zadd("z", 200.0, "b").await.unwrap();
        store.zadd("z", 300.0, "c").await.unwrap();

        assert_eq!(store.zcount("z", 150.0, 300.0).await.unwrap(), 2);
        assert_eq!(store.zcard("z").await.unwrap(), 3);

        let removed = store.zrem_range_by_score("z", 0.0, 200.0).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_is_fifo_under_lpush_rpop() {
        let store = MemoryStore::new();

        store.lpush("q", "first").await.unwrap();
        store.lpush("q", "second").await.unwrap();

        assert_eq!(store.llen("q").await.unwrap(), 2);
        assert_eq!(store.rpop("q").await.unwrap(), Some("first".to_string()));
        assert_eq!(store.rpop("q").await.unwrap(), Some("second".to_string()));
        assert_eq!(store.rpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lrange_and_lrem() {
        let store = MemoryStore::new();

        store.lpush("l", "a").await.unwrap();
        store.lpush("l", "b").await.unwrap();
        store.lpush("l", "c").await.unwrap();

        let all = store.lrange("l", 0, -1).await.unwrap();
        assert_eq!(all, vec!["c", "b", "a"]);

        let limited = store.lrange("l", 0, 1).await.unwrap();
        assert_eq!(limited, vec!["c", "b"]);

        assert_eq!(store.lrem("l", "b").await.unwrap(), 1);
        assert_eq!(store.lrem("l", "b").await.unwrap(), 0);
        assert_eq!(store.llen("l").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store = MemoryStore::new();

        store.set_ex("session:d1", "x", 60).await.unwrap();
        store.hset("session:d2", "p", "y").await.unwrap();
        store.set_ex("other:d3", "z", 60).await.unwrap();

        let keys = store.keys_with_prefix("session:").await.unwrap();
        assert_eq!(keys, vec!["session:d1", "session:d2"]);
    }

    #[tokio::test]
    async fn test_pubsub_delivery() {
        let store = MemoryStore::new();

        let mut sub = store.subscribe("topic").await.unwrap();
        store.publish("topic", "hello").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert_eq!(received, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let store = MemoryStore::new();
        // Must not error; pub/sub has no persistence.
        store.publish("empty", "ignored").await.unwrap();
    }
}
