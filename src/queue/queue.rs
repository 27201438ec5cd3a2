//! Queue structures in the cache store

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::{FailedJob, ProcessingJob, QueueError, QueueJob, QueueResult};
use crate::store::CacheStore;

const PENDING_KEY: &str = "document-updates";
const PROCESSING_KEY: &str = "processing-jobs";
const FAILED_KEY: &str = "failed-jobs";

/// Counts of jobs in each queue structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
}

/// Durable FIFO of pending jobs with a processing set and dead-letter list.
///
/// Direction is fixed: LPUSH onto the pending list, RPOP to claim, so jobs
/// drain oldest-first. Any number of workers may share the queue; the list
/// pop is atomic in the store.
pub struct PersistenceQueue {
    store: Arc<dyn CacheStore>,
}

impl PersistenceQueue {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Push a job onto the pending list. Returns the job id.
    pub async fn enqueue(&self, job: QueueJob) -> QueueResult<String> {
        let job_id = job.job_id.clone();
        let payload = serde_json::to_string(&job)?;
        self.store.lpush(PENDING_KEY, &payload).await?;

        log::debug!("enqueued {} job {}", job.job_type, job_id);
        Ok(job_id)
    }

    /// Claim the next due job, moving it into the processing set.
    ///
    /// A job still inside its retry backoff is pushed back to the head and
    /// `None` is returned for this tick; jobs behind it keep draining from
    /// the tail.
    pub async fn dequeue_one(&self) -> QueueResult<Option<ProcessingJob>> {
        let Some(raw) = self.store.rpop(PENDING_KEY).await? else {
            return Ok(None);
        };

        let job: QueueJob = match serde_json::from_str(&raw) {
            Ok(job) => job,
            Err(e) => {
                // A payload we cannot parse can never succeed; dead-letter
                // it raw rather than looping forever.
                log::error!("dead-lettering unparseable job payload: {}", e);
                let failed = serde_json::json!({
                    "raw": raw,
                    "error": format!("unparseable job: {}", e),
                    "failedAt": Utc::now().timestamp_millis(),
                });
                self.store
                    .lpush(FAILED_KEY, &failed.to_string())
                    .await?;
                return Ok(None);
            }
        };

        if !job.is_due(Utc::now().timestamp_millis()) {
            let payload = serde_json::to_string(&job)?;
            self.store.lpush(PENDING_KEY, &payload).await?;
            return Ok(None);
        }

        let claimed = ProcessingJob::claim(job);
        let snapshot = serde_json::to_string(&claimed)?;
        self.store
            .hset(PROCESSING_KEY, &claimed.job.job_id, &snapshot)
            .await?;

        Ok(Some(claimed))
    }

    /// Successful completion removes the job everywhere.
    pub async fn complete_job(&self, job_id: &str) -> QueueResult<()> {
        self.store.hdel(PROCESSING_KEY, job_id).await?;
        log::debug!("completed job {}", job_id);
        Ok(())
    }

    /// Record a failure. Retryable failures under the attempt budget go
    /// back to pending with a backoff; everything else dead-letters.
    pub async fn fail_job(&self, job_id: &str, error: &str, retryable: bool) -> QueueResult<()> {
        let Some(raw) = self.store.hget(PROCESSING_KEY, job_id).await? else {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        };
        self.store.hdel(PROCESSING_KEY, job_id).await?;

        let claimed: ProcessingJob = serde_json::from_str(&raw)?;
        let mut job = claimed.job;
        job.attempts += 1;

        if retryable && job.attempts < job.max_attempts {
            job.scheduled_for = Some(Utc::now().timestamp_millis() + job.backoff_ms as i64);
            log::warn!(
                "job {} failed (attempt {}/{}), retrying in {} ms: {}",
                job_id,
                job.attempts,
                job.max_attempts,
                job.backoff_ms,
                error
            );
            let payload = serde_json::to_string(&job)?;
            self.store.lpush(PENDING_KEY, &payload).await?;
            return Ok(());
        }

        log::error!(
            "job {} failed permanently after {} attempts: {}",
            job_id,
            job.attempts,
            error
        );
        let failed = FailedJob {
            job,
            error: error.to_string(),
            failed_at: Utc::now().timestamp_millis(),
        };
        let payload = serde_json::to_string(&failed)?;
        self.store.lpush(FAILED_KEY, &payload).await?;
        Ok(())
    }

    /// Move jobs that exceeded the soft timeout back through the failure
    /// path as retryable. Recovers work claimed by a worker that died.
    pub async fn reap_timed_out(&self, timeout_ms: i64) -> QueueResult<usize> {
        let cutoff = Utc::now().timestamp_millis() - timeout_ms;
        let entries = self.store.hget_all(PROCESSING_KEY).await?;

        let mut reaped = 0;
        for (job_id, raw) in entries {
            let Ok(claimed) = serde_json::from_str::<ProcessingJob>(&raw) else {
                self.store.hdel(PROCESSING_KEY, &job_id).await?;
                continue;
            };
            if claimed.processing_started_at < cutoff {
                self.fail_job(&job_id, "job timed out", true).await?;
                reaped += 1;
            }
        }

        Ok(reaped)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(QueueStats {
            pending: self.store.llen(PENDING_KEY).await?,
            processing: self.store.hlen(PROCESSING_KEY).await?,
            failed: self.store.llen(FAILED_KEY).await?,
        })
    }

    /// Most recent dead-lettered jobs, up to `limit`.
    pub async fn failed_jobs(&self, limit: usize) -> QueueResult<Vec<FailedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .store
            .lrange(FAILED_KEY, 0, limit as isize - 1)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect())
    }

    /// Move a dead-lettered job back to pending with a fresh attempt
    /// budget.
    pub async fn retry_failed_job(&self, job_id: &str) -> QueueResult<QueueJob> {
        let entries = self.store.lrange(FAILED_KEY, 0, -1).await?;

        for raw in entries {
            let Ok(failed) = serde_json::from_str::<FailedJob>(&raw) else {
                continue;
            };
            if failed.job.job_id != job_id {
                continue;
            }

            self.store.lrem(FAILED_KEY, &raw).await?;

            let mut job = failed.job;
            job.attempts = 0;
            job.scheduled_for = None;
            let payload = serde_json::to_string(&job)?;
            self.store.lpush(PENDING_KEY, &payload).await?;
            return Ok(job);
        }

        Err(QueueError::JobNotFound(job_id.to_string()))
    }

    /// Drop every queue structure. Admin use only.
    pub async fn clear_all(&self) -> QueueResult<()> {
        self.store.del(PENDING_KEY).await?;
        self.store.del(PROCESSING_KEY).await?;
        self.store.del(FAILED_KEY).await?;
        log::warn!("all queue structures cleared");
        Ok(())
    }
}
