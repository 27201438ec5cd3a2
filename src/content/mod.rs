//! Content snapshot cache
//!
//! Holds the last-known body and title per document under
//! `doc:content:{document_id}`. Two consumers: the update intake uses
//! [`ContentCache::has_changed`] to skip enqueueing no-op saves, and read
//! paths use it for warm reads without touching the durable store.
//!
//! Failure semantics are fail-safe toward persistence: if the store errors
//! or the entry is cold, the answer is "changed" and the write proceeds.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::CacheStore;

const CONTENT_KEY_PREFIX: &str = "doc:content:";

/// Content cache errors
#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Result type for content cache operations
pub type ContentResult<T> = Result<T, ContentError>;

/// Cached canonical snapshot of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub body: String,
    pub title: String,
    /// Epoch ms when the snapshot was cached.
    pub cached_at: i64,
    /// Monotonic version counter (wall-clock ms); never decreases for a
    /// given document.
    pub version: i64,
}

/// Result of a change check against the cached snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCheck {
    pub changed: bool,
    pub cached_body: Option<String>,
    pub cached_title: Option<String>,
}

impl ChangeCheck {
    fn changed() -> Self {
        Self {
            changed: true,
            cached_body: None,
            cached_title: None,
        }
    }
}

/// Last-known document content, shared across instances.
pub struct ContentCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl ContentCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Cached snapshot, if warm. A store error reads as a miss.
    pub async fn get(&self, document_id: &str) -> Option<Snapshot> {
        let raw = match self.store.get(&content_key(document_id)).await {
            Ok(raw) => raw?,
            Err(e) => {
                log::warn!("content cache read failed for {}: {}", document_id, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                log::warn!("malformed content snapshot for {}: {}", document_id, e);
                None
            }
        }
    }

    /// Store a fresh snapshot and reset its TTL. The version is wall-clock
    /// ms, clamped so it never moves backwards past the cached entry.
    pub async fn put(&self, document_id: &str, body: &str, title: &str) -> ContentResult<Snapshot> {
        let now_ms = Utc::now().timestamp_millis();
        let version = match self.get(document_id).await {
            Some(previous) => now_ms.max(previous.version),
            None => now_ms,
        };

        let snapshot = Snapshot {
            body: body.to_string(),
            title: title.to_string(),
            cached_at: now_ms,
            version,
        };

        let value = serde_json::to_string(&snapshot).map_err(crate::store::StoreError::from)?;
        self.store
            .set_ex(&content_key(document_id), &value, self.ttl.as_secs().max(1))
            .await?;

        Ok(snapshot)
    }

    /// Would persisting `(new_body, new_title)` change the document?
    ///
    /// Cold cache or store failure answers "changed"; a spurious write is
    /// cheaper than a lost one. The title only participates when provided.
    pub async fn has_changed(
        &self,
        document_id: &str,
        new_body: &str,
        new_title: Option<&str>,
    ) -> ChangeCheck {
        let Some(snapshot) = self.get(document_id).await else {
            return ChangeCheck::changed();
        };

        let body_changed = new_body != snapshot.body;
        let title_changed = new_title.is_some_and(|t| t != snapshot.title);

        ChangeCheck {
            changed: body_changed || title_changed,
            cached_body: Some(snapshot.body),
            cached_title: Some(snapshot.title),
        }
    }

    pub async fn invalidate(&self, document_id: &str) -> ContentResult<()> {
        self.store.del(&content_key(document_id)).await?;
        Ok(())
    }
}

fn content_key(document_id: &str) -> String {
    format!("{}{}", CONTENT_KEY_PREFIX, document_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache() -> ContentCache {
        ContentCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_cold_cache_reports_changed() {
        let cache = cache();

        let check = cache.has_changed("d1", "hello", None).await;
        assert!(check.changed);
        assert_eq!(check.cached_body, None);
    }

    #[tokio::test]
    async fn test_identical_body_is_not_a_change() {
        let cache = cache();
        cache.put("d1", "hello", "Notes").await.unwrap();

        let check = cache.has_changed("d1", "hello", None).await;
        assert!(!check.changed);
        assert_eq!(check.cached_body, Some("hello".to_string()));
        assert_eq!(check.cached_title, Some("Notes".to_string()));
    }

    #[tokio::test]
    async fn test_body_difference_is_a_change() {
        let cache = cache();
        cache.put("d1", "hello", "Notes").await.unwrap();

        assert!(cache.has_changed("d1", "hello world", None).await.changed);
    }

    #[tokio::test]
    async fn test_title_only_participates_when_provided() {
        let cache = cache();
        cache.put("d1", "hello", "Notes").await.unwrap();

        // Same body, no title supplied: unchanged regardless of cached title.
        assert!(!cache.has_changed("d1", "hello", None).await.changed);
        // Same body, different title supplied: changed.
        assert!(cache.has_changed("d1", "hello", Some("Renamed")).await.changed);
        // Same body, same title: unchanged.
        assert!(!cache.has_changed("d1", "hello", Some("Notes")).await.changed);
    }

    #[tokio::test]
    async fn test_version_never_decreases() {
        let cache = cache();

        let first = cache.put("d1", "a", "t").await.unwrap();
        let second = cache.put("d1", "b", "t").await.unwrap();

        assert!(second.version >= first.version);
    }

    #[tokio::test]
    async fn test_invalidate_clears_entry() {
        let cache = cache();
        cache.put("d1", "hello", "Notes").await.unwrap();

        cache.invalidate("d1").await.unwrap();
        assert!(cache.get("d1").await.is_none());
        assert!(cache.has_changed("d1", "hello", None).await.changed);
    }
}
