//! Data gateway for durable documents
//!
//! The hub never talks to document storage directly; all durable reads and
//! writes go through the [`DocumentGateway`] trait. Two implementations:
//!
//! - [`PgDocumentGateway`]: PostgreSQL via sqlx, the production backend
//! - [`MemoryDocumentGateway`]: process-local maps for tests and
//!   single-node deployments
//!
//! The error taxonomy matters more than the storage: `NotFound` and
//! `PermissionDenied` are terminal for a persistence job (straight to the
//! dead-letter queue), `Transient` is retryable.

mod memory;
mod postgres;

pub use memory::MemoryDocumentGateway;
pub use postgres::PgDocumentGateway;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Data gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Permission denied for {principal_id} on {document_id}")]
    PermissionDenied {
        principal_id: String,
        document_id: String,
    },

    #[error("Transient gateway error: {0}")]
    Transient(String),
}

impl GatewayError {
    /// Terminal errors must not be retried by the queue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PermissionDenied { .. })
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Durable document state as the gateway returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub document_id: String,
    pub title: String,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

/// One append-only edit-history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditHistoryEntry {
    pub document_id: String,
    pub principal_id: String,
    pub operation: String,
    /// Wall-clock ms; history is best-effort, not ordered.
    pub version: i64,
}

/// Contract between the hub and durable document storage.
#[async_trait::async_trait]
pub trait DocumentGateway: Send + Sync {
    /// The document, if it exists and the principal may see it.
    async fn document_visible_to(
        &self,
        principal_id: &str,
        document_id: &str,
    ) -> GatewayResult<DocumentRecord>;

    /// Whether the principal may write the document. Distinguishes
    /// `NotFound` from a plain `false` so HTTP can answer 404 vs 403.
    async fn can_edit(&self, principal_id: &str, document_id: &str) -> GatewayResult<bool>;

    /// Apply a partial update and return the final state. The gateway
    /// serializes writes per document; the queue relies on that.
    async fn update_document(
        &self,
        document_id: &str,
        principal_id: &str,
        title: Option<&str>,
        body: Option<&str>,
    ) -> GatewayResult<DocumentRecord>;

    /// Append an edit-history record. Callers treat failure as loggable,
    /// never as a job failure.
    async fn append_edit_history(&self, entry: &EditHistoryEntry) -> GatewayResult<()>;
}
