//! HTTP handlers
//!
//! The one endpoint that matters is the update intake: authorize, consult
//! the content cache for a no-op, enqueue, return immediately. Everything
//! durable happens later on the worker. The rest of the surface is warm
//! reads, presence views and queue administration.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::responses::ApiError;
use crate::app::AppState;
use crate::documents::DocumentGateway;
use crate::gateway::{Principal, TelemetrySnapshot, UserInfo};
use crate::queue::{
    DocumentUpdatePayload, DocumentUpdates, FailedJob, QueueError, QueueJob, QueueStats,
    DOCUMENT_UPDATE_JOB,
};

// ============================================================================
// Update intake
// ============================================================================

/// Body of `POST /documents/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateDocumentRequest {
    pub title: Option<String>,
    pub body: Option<String>,
}

/// Response of `POST /documents/{id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDocumentResponse {
    pub job_id: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// `POST /documents/{id}`: the update intake.
pub async fn update_document(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(document_id): Path<String>,
    Json(request): Json<UpdateDocumentRequest>,
) -> Result<Json<UpdateDocumentResponse>, ApiError> {
    if request.title.is_none() && request.body.is_none() {
        return Err(ApiError::bad_request(
            "at least one of title or body is required",
        ));
    }

    // 1. Authorize through the data gateway.
    let can_edit = state
        .documents
        .can_edit(&principal.principal_id, &document_id)
        .await
        .map_err(ApiError::from_gateway)?;
    if !can_edit {
        return Err(ApiError::forbidden(format!(
            "not a collaborator on {}",
            document_id
        )));
    }

    // 2. Skip no-op saves. Body-less saves compare the title against the
    //    cached snapshot; a cold cache always persists.
    let changed = match request.body.as_deref() {
        Some(body) => {
            state
                .content
                .has_changed(&document_id, body, request.title.as_deref())
                .await
                .changed
        }
        None => match state.content.get(&document_id).await {
            Some(snapshot) => request
                .title
                .as_deref()
                .is_some_and(|t| t != snapshot.title),
            None => true,
        },
    };

    if !changed {
        return Ok(Json(UpdateDocumentResponse {
            job_id: None,
            status: "skipped",
            reason: Some("no_changes"),
        }));
    }

    // 3. Enqueue and return; persistence completes asynchronously.
    let payload = DocumentUpdatePayload {
        document_id,
        principal_id: principal.principal_id,
        updates: DocumentUpdates {
            title: request.title,
            body: request.body,
        },
        metadata: serde_json::json!({ "source": "http-intake" }),
    };
    let job = QueueJob::new(
        DOCUMENT_UPDATE_JOB,
        serde_json::to_value(&payload)
            .map_err(|e| ApiError::internal_error(e.to_string()))?,
        state.config.queue_max_attempts,
        state.config.queue_backoff_ms,
    );

    let job_id = state
        .queue
        .enqueue(job)
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;

    Ok(Json(UpdateDocumentResponse {
        job_id: Some(job_id),
        status: "queued",
        reason: None,
    }))
}

// ============================================================================
// Warm reads
// ============================================================================

/// Document body served to readers, with its provenance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    pub document_id: String,
    pub title: String,
    pub body: String,
    pub source: &'static str,
}

/// `GET /documents/{id}`: cached snapshot when warm, gateway read (and
/// cache warm-up) otherwise.
pub async fn get_document(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(document_id): Path<String>,
) -> Result<Json<DocumentView>, ApiError> {
    if let Some(snapshot) = state.content.get(&document_id).await {
        // Even a cache hit requires visibility.
        state
            .documents
            .document_visible_to(&principal.principal_id, &document_id)
            .await
            .map_err(ApiError::from_gateway)?;

        return Ok(Json(DocumentView {
            document_id,
            title: snapshot.title,
            body: snapshot.body,
            source: "cache",
        }));
    }

    let record = state
        .documents
        .document_visible_to(&principal.principal_id, &document_id)
        .await
        .map_err(ApiError::from_gateway)?;

    if let Err(e) = state
        .content
        .put(&document_id, &record.body, &record.title)
        .await
    {
        log::warn!("cache warm-up failed for {}: {}", document_id, e);
    }

    Ok(Json(DocumentView {
        document_id: record.document_id,
        title: record.title,
        body: record.body,
        source: "store",
    }))
}

// ============================================================================
// Presence view
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceView {
    pub document_id: String,
    pub users: Vec<UserInfo>,
    pub count: usize,
}

/// `GET /presence/{document_id}`: read-only view over the registry.
pub async fn document_presence(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<PresenceView>, ApiError> {
    let sessions = state
        .presence
        .list_sessions(&document_id)
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;

    let users: Vec<UserInfo> = sessions
        .into_iter()
        .map(|s| UserInfo {
            principal_id: s.principal_id,
            display_name: s.display_name,
        })
        .collect();
    let count = users.len();

    Ok(Json(PresenceView {
        document_id,
        users,
        count,
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDocumentsView {
    pub documents: Vec<String>,
    pub count: usize,
}

/// `GET /presence`: every document with at least one live session anywhere
/// in the cluster.
pub async fn active_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ActiveDocumentsView>, ApiError> {
    let mut documents = state
        .presence
        .list_active_documents()
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    documents.sort();
    let count = documents.len();

    Ok(Json(ActiveDocumentsView { documents, count }))
}

// ============================================================================
// Queue administration
// ============================================================================

/// `GET /queue/stats`
pub async fn queue_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueStats>, ApiError> {
    state
        .queue
        .stats()
        .await
        .map(Json)
        .map_err(|e| ApiError::service_unavailable(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct FailedJobsQuery {
    #[serde(default = "default_failed_limit")]
    pub limit: usize,
}

fn default_failed_limit() -> usize {
    50
}

/// `GET /queue/failed?limit=N`
pub async fn failed_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FailedJobsQuery>,
) -> Result<Json<Vec<FailedJob>>, ApiError> {
    let jobs = state
        .queue
        .failed_jobs(query.limit)
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    Ok(Json(jobs))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub job_id: String,
    pub status: &'static str,
}

/// `POST /queue/failed/{job_id}/retry`
pub async fn retry_failed_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    match state.queue.retry_failed_job(&job_id).await {
        Ok(job) => Ok(Json(RetryResponse {
            job_id: job.job_id,
            status: "queued",
        })),
        Err(QueueError::JobNotFound(id)) => {
            Err(ApiError::not_found(format!("failed job {} not found", id)))
        }
        Err(e) => Err(ApiError::service_unavailable(e.to_string())),
    }
}

/// `DELETE /queue`: drop every queue structure.
pub async fn clear_queue(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    state
        .queue
        .clear_all()
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub realtime: TelemetrySnapshot,
}

/// `GET /health`: unauthenticated liveness with gateway telemetry.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: state.gateway.connection_count(),
        realtime: state.gateway.stats(),
    })
}
