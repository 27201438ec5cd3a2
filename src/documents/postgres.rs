//! PostgreSQL data gateway

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

use super::{DocumentGateway, DocumentRecord, EditHistoryEntry, GatewayError, GatewayResult};

/// sqlx-backed implementation of [`DocumentGateway`].
///
/// Expects the application schema's `documents`,
/// `document_collaborators` and `edit_history` tables. Per-document write
/// serialization comes from row-level locking on the `UPDATE`.
pub struct PgDocumentGateway {
    pool: PgPool,
}

impl PgDocumentGateway {
    /// Connect to the database, e.g. `postgres://localhost/synchub`.
    pub async fn connect(database_url: &str) -> GatewayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_error(document_id: &str, e: sqlx::Error) -> GatewayError {
        match e {
            sqlx::Error::RowNotFound => GatewayError::NotFound(document_id.to_string()),
            other => GatewayError::Transient(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl DocumentGateway for PgDocumentGateway {
    async fn document_visible_to(
        &self,
        principal_id: &str,
        document_id: &str,
    ) -> GatewayResult<DocumentRecord> {
        let row = sqlx::query(
            r#"
            SELECT d.id, d.title, d.body, d.updated_at
            FROM documents d
            WHERE d.id = $1
              AND (d.owner_id = $2
                   OR EXISTS (SELECT 1 FROM document_collaborators c
                              WHERE c.document_id = d.id AND c.principal_id = $2))
            "#,
        )
        .bind(document_id)
        .bind(principal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::map_error(document_id, e))?;

        let Some(row) = row else {
            // Visibility and existence are deliberately indistinguishable
            // here; the HTTP layer answers 404 either way.
            return Err(GatewayError::NotFound(document_id.to_string()));
        };

        Ok(DocumentRecord {
            document_id: row.get::<String, _>("id"),
            title: row.get("title"),
            body: row.get("body"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        })
    }

    async fn can_edit(&self, principal_id: &str, document_id: &str) -> GatewayResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT d.owner_id = $2
                   OR EXISTS (SELECT 1 FROM document_collaborators c
                              WHERE c.document_id = d.id
                                AND c.principal_id = $2
                                AND c.can_edit) AS editable
            FROM documents d
            WHERE d.id = $1
            "#,
        )
        .bind(document_id)
        .bind(principal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::map_error(document_id, e))?;

        match row {
            Some(row) => Ok(row.get::<bool, _>("editable")),
            None => Err(GatewayError::NotFound(document_id.to_string())),
        }
    }

    async fn update_document(
        &self,
        document_id: &str,
        principal_id: &str,
        title: Option<&str>,
        body: Option<&str>,
    ) -> GatewayResult<DocumentRecord> {
        if !self.can_edit(principal_id, document_id).await? {
            return Err(GatewayError::PermissionDenied {
                principal_id: principal_id.to_string(),
                document_id: document_id.to_string(),
            });
        }

        let row = sqlx::query(
            r#"
            UPDATE documents
            SET title = COALESCE($2, title),
                body = COALESCE($3, body),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, title, body, updated_at
            "#,
        )
        .bind(document_id)
        .bind(title)
        .bind(body)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::map_error(document_id, e))?;

        Ok(DocumentRecord {
            document_id: row.get::<String, _>("id"),
            title: row.get("title"),
            body: row.get("body"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        })
    }

    async fn append_edit_history(&self, entry: &EditHistoryEntry) -> GatewayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO edit_history (document_id, principal_id, operation, version, recorded_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(&entry.document_id)
        .bind(&entry.principal_id)
        .bind(&entry.operation)
        .bind(entry.version)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_error(&entry.document_id, e))?;

        Ok(())
    }
}
