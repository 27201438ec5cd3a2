//! Distributed presence registry
//!
//! The authoritative record of who is editing what. One hash per document
//! under `session:{document_id}`, keyed by principal id, holding a JSON
//! session record. The hash carries a TTL refreshed on every mutation and
//! is deleted once it empties, so a crashed instance's sessions age out on
//! their own (no instance owns the registry).
//!
//! Gateway processes keep their own `socket_id -> connection` index for
//! reachability; that index is never authoritative and never consulted for
//! membership. Membership is this registry, nothing else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::CacheStore;

/// Key prefix for per-document session hashes.
const SESSION_KEY_PREFIX: &str = "session:";

/// Presence errors
#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Malformed session record for {principal_id} in {document_id}: {source}")]
    MalformedRecord {
        document_id: String,
        principal_id: String,
        source: serde_json::Error,
    },
}

/// Result type for presence operations
pub type PresenceResult<T> = Result<T, PresenceError>;

/// One principal's live attachment to one document through one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub principal_id: String,
    pub display_name: String,
    /// Unique per connection; a re-join by the same principal supersedes
    /// the previous record, last-writer-wins on this field.
    pub socket_id: Uuid,
    /// Epoch milliseconds of the last observed activity.
    pub last_active: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<serde_json::Value>,
}

impl SessionRecord {
    pub fn new(principal_id: &str, display_name: &str, socket_id: Uuid) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            display_name: display_name.to_string(),
            socket_id,
            last_active: Utc::now().timestamp_millis(),
            cursor: None,
        }
    }

    pub fn is_stale(&self, ttl: Duration, now_ms: i64) -> bool {
        now_ms - self.last_active > ttl.as_millis() as i64
    }
}

/// Cluster-wide session registry backed by the cache store.
pub struct PresenceRegistry {
    store: Arc<dyn CacheStore>,
    session_ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn CacheStore>, session_ttl: Duration) -> Self {
        Self { store, session_ttl }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Create or overwrite the session for `(document, principal)`.
    ///
    /// A duplicate join supersedes the existing record; the superseded
    /// socket discovers its obsolescence through the TTL sweep or its own
    /// disconnect, no out-of-band signal is sent.
    pub async fn add_session(
        &self,
        document_id: &str,
        principal_id: &str,
        display_name: &str,
        socket_id: Uuid,
        cursor: Option<serde_json::Value>,
    ) -> PresenceResult<SessionRecord> {
        let mut record = SessionRecord::new(principal_id, display_name, socket_id);
        record.cursor = cursor;

        let key = session_key(document_id);
        let value = serde_json::to_string(&record).map_err(crate::store::StoreError::from)?;
        self.store.hset(&key, principal_id, &value).await?;
        self.refresh_ttl(&key).await?;

        Ok(record)
    }

    /// Remove the session; deletes the hash when it empties.
    pub async fn remove_session(&self, document_id: &str, principal_id: &str) -> PresenceResult<bool> {
        let key = session_key(document_id);
        let removed = self.store.hdel(&key, principal_id).await?;

        if removed && self.store.hlen(&key).await? == 0 {
            self.store.del(&key).await?;
        }

        Ok(removed)
    }

    /// Remove the session only if it is still owned by `socket_id`.
    ///
    /// A superseded connection's disconnect must not evict its successor;
    /// after a duplicate join the hash field belongs to the newer socket
    /// and the older one's removal is a no-op.
    pub async fn remove_session_owned(
        &self,
        document_id: &str,
        principal_id: &str,
        socket_id: Uuid,
    ) -> PresenceResult<bool> {
        let key = session_key(document_id);
        let Some(raw) = self.store.hget(&key, principal_id).await? else {
            return Ok(false);
        };

        // An unparseable record can never be superseded; remove it.
        let owned = serde_json::from_str::<SessionRecord>(&raw)
            .map(|r| r.socket_id == socket_id)
            .unwrap_or(true);
        if !owned {
            return Ok(false);
        }

        let removed = self.store.hdel(&key, principal_id).await?;
        if removed && self.store.hlen(&key).await? == 0 {
            self.store.del(&key).await?;
        }
        Ok(removed)
    }

    /// Update `last_active` and refresh the hash TTL.
    pub async fn touch(&self, document_id: &str, principal_id: &str) -> PresenceResult<()> {
        self.mutate_record(document_id, principal_id, |record| {
            record.last_active = Utc::now().timestamp_millis();
        })
        .await
    }

    /// Replace the cursor blob and refresh `last_active` and the TTL.
    pub async fn update_cursor(
        &self,
        document_id: &str,
        principal_id: &str,
        cursor: serde_json::Value,
    ) -> PresenceResult<()> {
        self.mutate_record(document_id, principal_id, |record| {
            record.cursor = Some(cursor);
            record.last_active = Utc::now().timestamp_millis();
        })
        .await
    }

    /// All sessions currently attached to a document.
    pub async fn list_sessions(&self, document_id: &str) -> PresenceResult<Vec<SessionRecord>> {
        let key = session_key(document_id);
        let fields = self.store.hget_all(&key).await?;

        let mut sessions = Vec::with_capacity(fields.len());
        for (principal_id, raw) in fields {
            match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) => sessions.push(record),
                Err(source) => {
                    // A corrupt field degrades the listing, not the caller.
                    log::warn!(
                        "dropping malformed session record for {} in {}: {}",
                        principal_id,
                        document_id,
                        source
                    );
                }
            }
        }

        sessions.sort_by(|a, b| a.principal_id.cmp(&b.principal_id));
        Ok(sessions)
    }

    pub async fn count_sessions(&self, document_id: &str) -> PresenceResult<usize> {
        Ok(self.store.hlen(&session_key(document_id)).await?)
    }

    /// Documents with at least one live session anywhere in the cluster.
    pub async fn list_active_documents(&self) -> PresenceResult<Vec<String>> {
        let keys = self.store.keys_with_prefix(SESSION_KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(SESSION_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    /// Remove sessions whose `last_active` is older than the TTL and delete
    /// hashes that empty out. Returns the number of sessions removed.
    pub async fn sweep_stale(&self) -> PresenceResult<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let keys = self.store.keys_with_prefix(SESSION_KEY_PREFIX).await?;

        let mut swept = 0;
        for key in keys {
            let fields = self.store.hget_all(&key).await?;
            for (principal_id, raw) in &fields {
                let stale = match serde_json::from_str::<SessionRecord>(raw) {
                    Ok(record) => record.is_stale(self.session_ttl, now_ms),
                    // Unparseable records cannot be refreshed, so they are
                    // stale by definition.
                    Err(_) => true,
                };

                if stale && self.store.hdel(&key, principal_id).await? {
                    swept += 1;
                }
            }

            if self.store.hlen(&key).await? == 0 {
                self.store.del(&key).await?;
            }
        }

        if swept > 0 {
            log::info!("presence sweep removed {} stale sessions", swept);
        }
        Ok(swept)
    }

    async fn mutate_record(
        &self,
        document_id: &str,
        principal_id: &str,
        mutate: impl FnOnce(&mut SessionRecord),
    ) -> PresenceResult<()> {
        let key = session_key(document_id);
        let Some(raw) = self.store.hget(&key, principal_id).await? else {
            // The session may have been swept or superseded; nothing to do.
            return Ok(());
        };

        let mut record: SessionRecord =
            serde_json::from_str(&raw).map_err(|source| PresenceError::MalformedRecord {
                document_id: document_id.to_string(),
                principal_id: principal_id.to_string(),
                source,
            })?;
        mutate(&mut record);

        let value = serde_json::to_string(&record).map_err(crate::store::StoreError::from)?;
        self.store.hset(&key, principal_id, &value).await?;
        self.refresh_ttl(&key).await?;
        Ok(())
    }

    async fn refresh_ttl(&self, key: &str) -> PresenceResult<()> {
        self.store
            .expire(key, self.session_ttl.as_secs().max(1))
            .await?;
        Ok(())
    }
}

fn session_key(document_id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, document_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(Arc::new(MemoryStore::new()), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_add_and_list_sessions() {
        let registry = registry();

        registry
            .add_session("d1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();
        registry
            .add_session("d1", "bob", "Bob", Uuid::new_v4(), None)
            .await
            .unwrap();

        let sessions = registry.list_sessions("d1").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].principal_id, "alice");
        assert_eq!(sessions[1].principal_id, "bob");
        assert_eq!(registry.count_sessions("d1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_join_supersedes() {
        let registry = registry();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        registry
            .add_session("d1", "alice", "Alice", s1, None)
            .await
            .unwrap();
        registry
            .add_session("d1", "alice", "Alice", s2, None)
            .await
            .unwrap();

        let sessions = registry.list_sessions("d1").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].socket_id, s2);
    }

    #[tokio::test]
    async fn test_remove_last_session_deletes_hash() {
        let store = Arc::new(MemoryStore::new());
        let registry =
            PresenceRegistry::new(Arc::clone(&store) as Arc<dyn CacheStore>, Duration::from_secs(300));

        registry
            .add_session("d1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();
        assert!(registry.remove_session("d1", "alice").await.unwrap());

        assert!(registry.list_active_documents().await.unwrap().is_empty());
        assert_eq!(store.hlen("session:d1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_owned_removal_skips_superseded_socket() {
        let registry = registry();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        registry
            .add_session("d1", "alice", "Alice", s1, None)
            .await
            .unwrap();
        registry
            .add_session("d1", "alice", "Alice", s2, None)
            .await
            .unwrap();

        // The superseded socket's disconnect is a no-op.
        assert!(!registry
            .remove_session_owned("d1", "alice", s1)
            .await
            .unwrap());
        assert_eq!(registry.count_sessions("d1").await.unwrap(), 1);

        // The owner removes normally.
        assert!(registry
            .remove_session_owned("d1", "alice", s2)
            .await
            .unwrap());
        assert_eq!(registry.count_sessions("d1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_session_is_noop() {
        let registry = registry();
        assert!(!registry.remove_session("d1", "ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_refreshes_last_active() {
        let registry = registry();

        let record = registry
            .add_session("d1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.touch("d1", "alice").await.unwrap();

        let sessions = registry.list_sessions("d1").await.unwrap();
        assert!(sessions[0].last_active >= record.last_active);
    }

    #[tokio::test]
    async fn test_update_cursor() {
        let registry = registry();

        registry
            .add_session("d1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();
        registry
            .update_cursor("d1", "alice", serde_json::json!({"anchor": 5}))
            .await
            .unwrap();

        let sessions = registry.list_sessions("d1").await.unwrap();
        assert_eq!(sessions[0].cursor, Some(serde_json::json!({"anchor": 5})));
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_sessions() {
        let store = Arc::new(MemoryStore::new());
        let registry =
            PresenceRegistry::new(Arc::clone(&store) as Arc<dyn CacheStore>, Duration::from_secs(300));

        registry
            .add_session("d1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();

        // Backdate alice past the TTL threshold.
        let mut stale = SessionRecord::new("alice", "Alice", Uuid::new_v4());
        stale.last_active = Utc::now().timestamp_millis() - 301_000;
        store
            .hset(
                "session:d1",
                "alice",
                &serde_json::to_string(&stale).unwrap(),
            )
            .await
            .unwrap();

        registry
            .add_session("d1", "bob", "Bob", Uuid::new_v4(), None)
            .await
            .unwrap();

        let swept = registry.sweep_stale().await.unwrap();
        assert_eq!(swept, 1);

        let sessions = registry.list_sessions("d1").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].principal_id, "bob");
    }

    #[tokio::test]
    async fn test_sweep_drops_empty_documents() {
        let store = Arc::new(MemoryStore::new());
        let registry =
            PresenceRegistry::new(Arc::clone(&store) as Arc<dyn CacheStore>, Duration::from_secs(300));

        let mut stale = SessionRecord::new("alice", "Alice", Uuid::new_v4());
        stale.last_active = Utc::now().timestamp_millis() - 600_000;
        store
            .hset(
                "session:d9",
                "alice",
                &serde_json::to_string(&stale).unwrap(),
            )
            .await
            .unwrap();

        registry.sweep_stale().await.unwrap();
        assert!(registry.list_active_documents().await.unwrap().is_empty());
    }
}
