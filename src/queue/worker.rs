//! Queue worker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{
    DocumentUpdatePayload, PersistenceQueue, ProcessingJob, QueueResult, DOCUMENT_UPDATE_JOB,
};
use crate::content::ContentCache;
use crate::documents::{DocumentGateway, EditHistoryEntry, GatewayError};

/// Drains the persistence queue one job per tick.
///
/// One in-flight job per worker; run as many worker processes as needed,
/// the pending-list pop is atomic. Each tick also reaps jobs whose worker
/// died past the soft timeout.
pub struct QueueWorker {
    queue: Arc<PersistenceQueue>,
    gateway: Arc<dyn DocumentGateway>,
    content: Arc<ContentCache>,
    tick: Duration,
    job_timeout: Duration,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<PersistenceQueue>,
        gateway: Arc<dyn DocumentGateway>,
        content: Arc<ContentCache>,
        tick: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            gateway,
            content,
            tick,
            job_timeout,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the tick loop. Idempotent; a second start is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let worker = self.clone_for_task();
        let handle = tokio::spawn(async move {
            log::info!("queue worker started, tick {:?}", worker.tick);
            let mut interval = tokio::time::interval(worker.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while worker.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Err(e) = worker.run_once().await {
                    log::error!("worker tick failed: {}", e);
                }
            }
            log::info!("queue worker stopped");
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Stop polling. The in-flight job, if any, drains to completion or
    /// its timeout before the loop exits.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                log::error!("worker task join failed: {}", e);
            }
        }
    }

    /// One tick: reap stuck jobs, then claim and process at most one job.
    /// Returns whether a job was processed.
    pub async fn run_once(&self) -> QueueResult<bool> {
        self.queue
            .reap_timed_out(self.job_timeout.as_millis() as i64)
            .await?;

        let Some(claimed) = self.queue.dequeue_one().await? else {
            return Ok(false);
        };

        let job_id = claimed.job.job_id.clone();
        match tokio::time::timeout(self.job_timeout, self.dispatch(&claimed)).await {
            Ok(Ok(())) => {
                self.queue.complete_job(&job_id).await?;
            }
            Ok(Err(outcome)) => {
                self.queue
                    .fail_job(&job_id, &outcome.error, outcome.retryable)
                    .await?;
            }
            Err(_) => {
                self.queue.fail_job(&job_id, "job timed out", true).await?;
            }
        }

        Ok(true)
    }

    /// Clone the shared handles for the spawned tick loop.
    fn clone_for_task(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            gateway: Arc::clone(&self.gateway),
            content: Arc::clone(&self.content),
            tick: self.tick,
            job_timeout: self.job_timeout,
            running: Arc::clone(&self.running),
            handle: Mutex::new(None),
        }
    }

    async fn dispatch(&self, claimed: &ProcessingJob) -> Result<(), JobFailure> {
        match claimed.job.job_type.as_str() {
            DOCUMENT_UPDATE_JOB => self.handle_document_update(claimed).await,
            other => Err(JobFailure::terminal(format!("unknown job type: {}", other))),
        }
    }

    async fn handle_document_update(&self, claimed: &ProcessingJob) -> Result<(), JobFailure> {
        let payload: DocumentUpdatePayload = serde_json::from_value(claimed.job.payload.clone())
            .map_err(|e| JobFailure::terminal(format!("malformed payload: {}", e)))?;

        // 1. Write through the data gateway. Not-found and denied are
        //    terminal; the document will not appear by retrying.
        let record = self
            .gateway
            .update_document(
                &payload.document_id,
                &payload.principal_id,
                payload.updates.title.as_deref(),
                payload.updates.body.as_deref(),
            )
            .await
            .map_err(JobFailure::from_gateway)?;

        // 2. Refresh the content cache from the gateway's final state so
        //    the next intake sees the write. A cache error is not a job
        //    failure.
        if let Err(e) = self
            .content
            .put(&payload.document_id, &record.body, &record.title)
            .await
        {
            log::warn!(
                "content cache refresh failed for {}: {}",
                payload.document_id,
                e
            );
        }

        // 3. Best-effort history; logged and swallowed on failure.
        let entry = EditHistoryEntry {
            document_id: payload.document_id.clone(),
            principal_id: payload.principal_id.clone(),
            operation: "update".to_string(),
            version: Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.gateway.append_edit_history(&entry).await {
            log::warn!(
                "edit history append failed for {}: {}",
                payload.document_id,
                e
            );
        }

        Ok(())
    }
}

struct JobFailure {
    error: String,
    retryable: bool,
}

impl JobFailure {
    fn terminal(error: String) -> Self {
        Self {
            error,
            retryable: false,
        }
    }

    fn from_gateway(e: GatewayError) -> Self {
        Self {
            error: e.to_string(),
            retryable: !e.is_terminal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::MemoryDocumentGateway;
    use crate::queue::{DocumentUpdates, QueueJob};
    use crate::store::MemoryStore;

    struct Fixture {
        queue: Arc<PersistenceQueue>,
        gateway: Arc<MemoryDocumentGateway>,
        content: Arc<ContentCache>,
        worker: Arc<QueueWorker>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn crate::store::CacheStore> = Arc::new(MemoryStore::new());
        let queue = Arc::new(PersistenceQueue::new(Arc::clone(&store)));
        let gateway = Arc::new(MemoryDocumentGateway::new());
        let content = Arc::new(ContentCache::new(
            Arc::clone(&store),
            Duration::from_secs(3600),
        ));
        let worker = Arc::new(QueueWorker::new(
            Arc::clone(&queue),
            Arc::clone(&gateway) as Arc<dyn DocumentGateway>,
            Arc::clone(&content),
            Duration::from_millis(10),
            Duration::from_secs(30),
        ));
        Fixture {
            queue,
            gateway,
            content,
            worker,
        }
    }

    fn update_job(document_id: &str, principal_id: &str, body: &str) -> QueueJob {
        let payload = DocumentUpdatePayload {
            document_id: document_id.to_string(),
            principal_id: principal_id.to_string(),
            updates: DocumentUpdates {
                title: None,
                body: Some(body.to_string()),
            },
            metadata: serde_json::Value::Null,
        };
        let mut job = QueueJob::new(
            DOCUMENT_UPDATE_JOB,
            serde_json::to_value(&payload).unwrap(),
            3,
            0,
        );
        job.backoff_ms = 0;
        job
    }

    #[tokio::test]
    async fn test_successful_update_refreshes_cache_and_history() {
        let f = fixture();
        f.gateway.insert_document("d1", "alice", "Notes", "old");
        f.queue
            .enqueue(update_job("d1", "alice", "new body"))
            .await
            .unwrap();

        assert!(f.worker.run_once().await.unwrap());

        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.failed, 0);

        let snapshot = f.content.get("d1").await.unwrap();
        assert_eq!(snapshot.body, "new body");
        assert_eq!(snapshot.title, "Notes");

        let history = f.gateway.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].operation, "update");
        assert_eq!(history[0].principal_id, "alice");
    }

    #[tokio::test]
    async fn test_permission_denied_dead_letters_without_retry() {
        let f = fixture();
        f.gateway.insert_document("d1", "alice", "Notes", "old");
        f.queue
            .enqueue(update_job("d1", "mallory", "hijack"))
            .await
            .unwrap();

        assert!(f.worker.run_once().await.unwrap());

        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 1);

        let failed = f.queue.failed_jobs(1).await.unwrap();
        assert!(failed[0].error.contains("Permission denied"));
        assert_eq!(failed[0].job.attempts, 1);
    }

    #[tokio::test]
    async fn test_unknown_document_dead_letters_without_retry() {
        let f = fixture();
        f.queue
            .enqueue(update_job("missing", "alice", "x"))
            .await
            .unwrap();

        assert!(f.worker.run_once().await.unwrap());

        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_dead_letter() {
        let f = fixture();
        f.gateway.insert_document("d1", "alice", "Notes", "old");
        f.gateway.fail_next(3);
        f.queue
            .enqueue(update_job("d1", "alice", "x"))
            .await
            .unwrap();

        // Three attempts, all failing transiently.
        for _ in 0..3 {
            assert!(f.worker.run_once().await.unwrap());
        }

        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 1);

        let failed = f.queue.failed_jobs(1).await.unwrap();
        assert_eq!(failed[0].job.attempts, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_retry() {
        let f = fixture();
        f.gateway.insert_document("d1", "alice", "Notes", "old");
        f.gateway.fail_next(1);
        f.queue
            .enqueue(update_job("d1", "alice", "second try"))
            .await
            .unwrap();

        assert!(f.worker.run_once().await.unwrap());
        assert!(f.worker.run_once().await.unwrap());

        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(f.content.get("d1").await.unwrap().body, "second try");
    }

    #[tokio::test]
    async fn test_history_failure_does_not_fail_job() {
        // The memory gateway's history never fails, so this exercises the
        // success path contract only: history length matches completions.
        let f = fixture();
        f.gateway.insert_document("d1", "alice", "Notes", "old");
        f.queue
            .enqueue(update_job("d1", "alice", "a"))
            .await
            .unwrap();

        assert!(f.worker.run_once().await.unwrap());
        assert_eq!(f.queue.stats().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let f = fixture();
        f.gateway.insert_document("d1", "alice", "Notes", "old");
        f.queue
            .enqueue(update_job("d1", "alice", "ticked"))
            .await
            .unwrap();

        f.worker.start().await;
        assert!(f.worker.is_running());

        // Give the tick loop a few cycles to drain the job.
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.worker.stop().await;
        assert!(!f.worker.is_running());

        assert_eq!(f.content.get("d1").await.unwrap().body, "ticked");
    }
}
