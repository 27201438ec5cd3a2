//! Queue job types

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// The only job type the worker currently dispatches.
pub const DOCUMENT_UPDATE_JOB: &str = "document-update";

/// A unit of durable work waiting in the pending list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Epoch ms when the job was first enqueued.
    pub created_at: i64,
    /// Epoch ms before which the job must not run (retry backoff).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<i64>,
}

impl QueueJob {
    pub fn new(
        job_type: &str,
        payload: serde_json::Value,
        max_attempts: u32,
        backoff_ms: u64,
    ) -> Self {
        Self {
            job_id: generate_job_id(),
            job_type: job_type.to_string(),
            payload,
            attempts: 0,
            max_attempts,
            backoff_ms,
            created_at: Utc::now().timestamp_millis(),
            scheduled_for: None,
        }
    }

    /// Whether the job may run now (backoff elapsed or none set).
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now_ms)
    }
}

/// A job claimed by a worker, parked in the processing set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJob {
    #[serde(flatten)]
    pub job: QueueJob,
    /// Epoch ms when a worker claimed the job; the reaper uses this to
    /// recover jobs whose worker died mid-flight.
    pub processing_started_at: i64,
}

impl ProcessingJob {
    pub fn claim(job: QueueJob) -> Self {
        Self {
            job,
            processing_started_at: Utc::now().timestamp_millis(),
        }
    }
}

/// A permanently failed job in the dead-letter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    #[serde(flatten)]
    pub job: QueueJob,
    pub error: String,
    pub failed_at: i64,
}

/// Payload of a `document-update` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdatePayload {
    pub document_id: String,
    pub principal_id: String,
    pub updates: DocumentUpdates,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Partial document update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Job ids are sortable by creation time with a random suffix for
/// uniqueness, e.g. `job_1722508800123_k3v9px2q`.
fn generate_job_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "job_{}_{}",
        Utc::now().timestamp_millis(),
        suffix.to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        let a = QueueJob::new(DOCUMENT_UPDATE_JOB, serde_json::json!({}), 3, 5_000);
        let b = QueueJob::new(DOCUMENT_UPDATE_JOB, serde_json::json!({}), 3, 5_000);
        assert_ne!(a.job_id, b.job_id);
        assert!(a.job_id.starts_with("job_"));
    }

    #[test]
    fn test_due_checks_backoff() {
        let mut job = QueueJob::new(DOCUMENT_UPDATE_JOB, serde_json::json!({}), 3, 5_000);
        let now = Utc::now().timestamp_millis();

        assert!(job.is_due(now));
        job.scheduled_for = Some(now + 5_000);
        assert!(!job.is_due(now));
        assert!(job.is_due(now + 5_000));
    }

    #[test]
    fn test_job_wire_shape() {
        let payload = DocumentUpdatePayload {
            document_id: "d1".to_string(),
            principal_id: "alice".to_string(),
            updates: DocumentUpdates {
                title: None,
                body: Some("hello".to_string()),
            },
            metadata: serde_json::json!({"source": "autosave"}),
        };
        let job = QueueJob::new(
            DOCUMENT_UPDATE_JOB,
            serde_json::to_value(&payload).unwrap(),
            3,
            5_000,
        );

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&job).unwrap()).unwrap();
        assert_eq!(json["type"], "document-update");
        assert_eq!(json["payload"]["documentId"], "d1");
        assert_eq!(json["payload"]["updates"]["body"], "hello");
        assert!(json.get("scheduledFor").is_none());
    }
}
