//! In-process data gateway

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{DocumentGateway, DocumentRecord, EditHistoryEntry, GatewayError, GatewayResult};

/// Map-backed implementation of [`DocumentGateway`] for tests and
/// single-node deployments.
///
/// Also doubles as a fault injector: [`MemoryDocumentGateway::fail_next`]
/// arms a number of upcoming `update_document` calls to return a transient
/// error, which is how the retry/dead-letter paths are exercised.
#[derive(Default)]
pub struct MemoryDocumentGateway {
    documents: DashMap<String, DocumentRecord>,
    owners: DashMap<String, String>,
    editors: DashMap<String, HashSet<String>>,
    history: Mutex<Vec<EditHistoryEntry>>,
    transient_failures: AtomicU32,
}

impl MemoryDocumentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document owned by `owner_id`.
    pub fn insert_document(&self, document_id: &str, owner_id: &str, title: &str, body: &str) {
        self.documents.insert(
            document_id.to_string(),
            DocumentRecord {
                document_id: document_id.to_string(),
                title: title.to_string(),
                body: body.to_string(),
                updated_at: Utc::now(),
            },
        );
        self.owners
            .insert(document_id.to_string(), owner_id.to_string());
    }

    /// Grant a principal edit access to a document.
    pub fn grant_edit(&self, document_id: &str, principal_id: &str) {
        self.editors
            .entry(document_id.to_string())
            .or_default()
            .insert(principal_id.to_string());
    }

    /// Arm the next `count` update calls to fail transiently.
    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// History entries recorded so far, oldest first.
    pub fn history(&self) -> Vec<EditHistoryEntry> {
        self.history.lock().clone()
    }

    fn has_access(&self, principal_id: &str, document_id: &str) -> bool {
        let owns = self
            .owners
            .get(document_id)
            .map(|o| o.value() == principal_id)
            .unwrap_or(false);
        let edits = self
            .editors
            .get(document_id)
            .map(|e| e.contains(principal_id))
            .unwrap_or(false);
        owns || edits
    }
}

#[async_trait::async_trait]
impl DocumentGateway for MemoryDocumentGateway {
    async fn document_visible_to(
        &self,
        principal_id: &str,
        document_id: &str,
    ) -> GatewayResult<DocumentRecord> {
        let Some(record) = self.documents.get(document_id) else {
            return Err(GatewayError::NotFound(document_id.to_string()));
        };
        if !self.has_access(principal_id, document_id) {
            return Err(GatewayError::NotFound(document_id.to_string()));
        }
        Ok(record.clone())
    }

    async fn can_edit(&self, principal_id: &str, document_id: &str) -> GatewayResult<bool> {
        if !self.documents.contains_key(document_id) {
            return Err(GatewayError::NotFound(document_id.to_string()));
        }
        Ok(self.has_access(principal_id, document_id))
    }

    async fn update_document(
        &self,
        document_id: &str,
        principal_id: &str,
        title: Option<&str>,
        body: Option<&str>,
    ) -> GatewayResult<DocumentRecord> {
        let armed = self.transient_failures.load(Ordering::SeqCst);
        if armed > 0
            && self
                .transient_failures
                .compare_exchange(armed, armed - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(GatewayError::Transient("injected failure".to_string()));
        }

        if !self.documents.contains_key(document_id) {
            return Err(GatewayError::NotFound(document_id.to_string()));
        }
        if !self.has_access(principal_id, document_id) {
            return Err(GatewayError::PermissionDenied {
                principal_id: principal_id.to_string(),
                document_id: document_id.to_string(),
            });
        }

        let mut record = self
            .documents
            .get_mut(document_id)
            .ok_or_else(|| GatewayError::NotFound(document_id.to_string()))?;
        if let Some(title) = title {
            record.title = title.to_string();
        }
        if let Some(body) = body {
            record.body = body.to_string();
        }
        record.updated_at = Utc::now();

        Ok(record.clone())
    }

    async fn append_edit_history(&self, entry: &EditHistoryEntry) -> GatewayResult<()> {
        self.history.lock().push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_owner_can_edit() {
        let gateway = MemoryDocumentGateway::new();
        gateway.insert_document("d1", "alice", "Notes", "hello");

        assert!(gateway.can_edit("alice", "d1").await.unwrap());
        assert!(!gateway.can_edit("bob", "d1").await.unwrap());

        gateway.grant_edit("d1", "bob");
        assert!(gateway.can_edit("bob", "d1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_document_is_not_found() {
        let gateway = MemoryDocumentGateway::new();

        let err = gateway.can_edit("alice", "missing").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_partial_update_preserves_other_field() {
        let gateway = MemoryDocumentGateway::new();
        gateway.insert_document("d1", "alice", "Notes", "hello");

        let record = gateway
            .update_document("d1", "alice", None, Some("hello world"))
            .await
            .unwrap();
        assert_eq!(record.title, "Notes");
        assert_eq!(record.body, "hello world");
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient_and_finite() {
        let gateway = MemoryDocumentGateway::new();
        gateway.insert_document("d1", "alice", "Notes", "hello");
        gateway.fail_next(2);

        for _ in 0..2 {
            let err = gateway
                .update_document("d1", "alice", None, Some("x"))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Transient(_)));
            assert!(!err.is_terminal());
        }

        assert!(gateway
            .update_document("d1", "alice", None, Some("x"))
            .await
            .is_ok());
    }
}
