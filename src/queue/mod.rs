//! Persistence queue and worker
//!
//! Durable document writes never happen on the request path. The intake
//! enqueues a `document-update` job; a worker drains the queue, writes
//! through the data gateway, refreshes the content cache and records edit
//! history. Three physical structures in the cache store:
//!
//! - `document-updates`: pending list, FIFO (LPUSH head, RPOP tail)
//! - `processing-jobs`: hash of in-flight jobs with their start time
//! - `failed-jobs`: dead-letter list of permanently failed jobs
//!
//! Dequeue is pop-then-mark, not atomic across the two steps; a worker
//! crash in between loses one job attempt. Acceptable: the client retries
//! on its next save and the content cache short-circuits a re-enqueue when
//! the state already matches.

mod job;
mod queue;
mod worker;

pub use job::{
    DocumentUpdatePayload, DocumentUpdates, FailedJob, ProcessingJob, QueueJob,
    DOCUMENT_UPDATE_JOB,
};
pub use queue::{PersistenceQueue, QueueStats};
pub use worker::QueueWorker;

use thiserror::Error;

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
