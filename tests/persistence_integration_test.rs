// Integration tests for the persistence plane: update intake, content
// cache deduplication, queue retry/dead-letter flow and warm reads.

#[cfg(test)]
mod persistence_integration_tests {
    use std::sync::Arc;
    use std::time::Instant;

    use axum::extract::{Extension, Path, Query, State};
    use axum::Json;

    use synchub::api::handlers::{
        failed_jobs, get_document, queue_stats, retry_failed_job, update_document,
        FailedJobsQuery, UpdateDocumentRequest,
    };
    use synchub::api::TokenVerifier;
    use synchub::app::AppState;
    use synchub::bus::DocumentBus;
    use synchub::config::HubConfig;
    use synchub::content::ContentCache;
    use synchub::documents::{DocumentGateway, MemoryDocumentGateway};
    use synchub::gateway::{CollabGateway, Principal};
    use synchub::presence::PresenceRegistry;
    use synchub::queue::{PersistenceQueue, QueueWorker};
    use synchub::ratelimit::RateLimiter;
    use synchub::store::{CacheStore, MemoryStore};

    struct Harness {
        state: Arc<AppState>,
        documents: Arc<MemoryDocumentGateway>,
        worker: QueueWorker,
    }

    fn principal(id: &str) -> Principal {
        Principal {
            principal_id: id.to_string(),
            display_name: id.to_uppercase(),
        }
    }

    fn harness() -> Harness {
        let config = HubConfig::for_tests("integration-secret");
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let documents = Arc::new(MemoryDocumentGateway::new());

        let presence = Arc::new(PresenceRegistry::new(
            Arc::clone(&store),
            config.session_ttl,
        ));
        let bus = Arc::new(DocumentBus::new(Arc::clone(&store)));
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            config.rate_limit_table(),
        ));
        let content = Arc::new(ContentCache::new(Arc::clone(&store), config.cache_ttl));
        let queue = Arc::new(PersistenceQueue::new(Arc::clone(&store)));
        let gateway = CollabGateway::new(Arc::clone(&presence), bus, limiter);
        let verifier = Arc::new(TokenVerifier::new(&config.jwt_secret));

        let worker = QueueWorker::new(
            Arc::clone(&queue),
            Arc::clone(&documents) as Arc<dyn DocumentGateway>,
            Arc::clone(&content),
            config.queue_tick,
            config.job_timeout,
        );

        let state = Arc::new(AppState {
            config,
            store,
            presence,
            content,
            queue,
            documents: Arc::clone(&documents) as Arc<dyn DocumentGateway>,
            gateway,
            verifier,
            started_at: Instant::now(),
        });

        Harness {
            state,
            documents,
            worker,
        }
    }

    async fn post_update(
        h: &Harness,
        who: &str,
        doc: &str,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<synchub::api::handlers::UpdateDocumentResponse, synchub::api::ApiError> {
        update_document(
            State(Arc::clone(&h.state)),
            Extension(principal(who)),
            Path(doc.to_string()),
            Json(UpdateDocumentRequest {
                title: title.map(str::to_string),
                body: body.map(str::to_string),
            }),
        )
        .await
        .map(|json| json.0)
    }

    #[tokio::test]
    async fn test_noop_save_is_skipped() {
        let h = harness();
        h.documents.insert_document("D2", "alice", "Notes", "hello");
        h.state.content.put("D2", "hello", "Notes").await.unwrap();

        let response = post_update(&h, "alice", "D2", None, Some("hello"))
            .await
            .unwrap();

        assert_eq!(response.status, "skipped");
        assert_eq!(response.reason, Some("no_changes"));
        assert!(response.job_id.is_none());

        // Queue pending count unchanged.
        let stats = queue_stats(State(Arc::clone(&h.state))).await.unwrap().0;
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_second_identical_save_is_skipped_after_persistence() {
        let h = harness();
        h.documents.insert_document("D1", "alice", "Notes", "old");

        // First save enqueues.
        let first = post_update(&h, "alice", "D1", None, Some("new body"))
            .await
            .unwrap();
        assert_eq!(first.status, "queued");
        assert!(first.job_id.is_some());

        // Worker persists and refreshes the cache.
        assert!(h.worker.run_once().await.unwrap());

        // Identical save now skips.
        let second = post_update(&h, "alice", "D1", None, Some("new body"))
            .await
            .unwrap();
        assert_eq!(second.status, "skipped");
        assert_eq!(second.reason, Some("no_changes"));

        let stats = queue_stats(State(Arc::clone(&h.state))).await.unwrap().0;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_intake_authorization() {
        let h = harness();
        h.documents.insert_document("D1", "alice", "Notes", "x");

        // Not a collaborator: 403.
        let denied = post_update(&h, "mallory", "D1", None, Some("y"))
            .await
            .unwrap_err();
        assert_eq!(denied.status, 403);

        // Unknown document: 404.
        let missing = post_update(&h, "alice", "missing", None, Some("y"))
            .await
            .unwrap_err();
        assert_eq!(missing.status, 404);

        // Empty update: 400.
        let empty = post_update(&h, "alice", "D1", None, None).await.unwrap_err();
        assert_eq!(empty.status, 400);
    }

    #[tokio::test]
    async fn test_retry_and_dead_letter_flow() {
        let h = harness();
        h.documents.insert_document("D1", "alice", "Notes", "old");
        h.documents.fail_next(3);

        let response = post_update(&h, "alice", "D1", None, Some("durable"))
            .await
            .unwrap();
        let job_id = response.job_id.unwrap();

        // Three attempts, all transient failures: the job dead-letters.
        for _ in 0..3 {
            assert!(h.worker.run_once().await.unwrap());
        }
        let stats = queue_stats(State(Arc::clone(&h.state))).await.unwrap().0;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 1);

        // The job is retrievable from the dead-letter list by id.
        let failed = failed_jobs(
            State(Arc::clone(&h.state)),
            Query(FailedJobsQuery { limit: 10 }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.job_id, job_id);
        assert_eq!(failed[0].job.attempts, 3);

        // Retrying moves it back to pending with a fresh attempt budget.
        let retried = retry_failed_job(State(Arc::clone(&h.state)), Path(job_id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(retried.job_id, job_id);
        assert_eq!(retried.status, "queued");

        // The gateway has recovered; the retry persists.
        assert!(h.worker.run_once().await.unwrap());
        let stats = queue_stats(State(Arc::clone(&h.state))).await.unwrap().0;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(h.state.content.get("D1").await.unwrap().body, "durable");

        // Retrying an unknown id is a 404.
        let unknown = retry_failed_job(State(Arc::clone(&h.state)), Path("job_0_nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(unknown.status, 404);
    }

    #[tokio::test]
    async fn test_warm_read_populates_cache() {
        let h = harness();
        h.documents.insert_document("D1", "alice", "Notes", "contents");

        // Cold: served from the store and warms the cache.
        let view = get_document(
            State(Arc::clone(&h.state)),
            Extension(principal("alice")),
            Path("D1".to_string()),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(view.source, "store");
        assert_eq!(view.body, "contents");

        // Warm: served from the cache.
        let view = get_document(
            State(Arc::clone(&h.state)),
            Extension(principal("alice")),
            Path("D1".to_string()),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(view.source, "cache");

        // Visibility still enforced on cache hits.
        let denied = get_document(
            State(Arc::clone(&h.state)),
            Extension(principal("mallory")),
            Path("D1".to_string()),
        )
        .await;
        assert!(denied.is_err());
    }

    #[tokio::test]
    async fn test_title_only_save() {
        let h = harness();
        h.documents.insert_document("D1", "alice", "Notes", "body");
        h.state.content.put("D1", "body", "Notes").await.unwrap();

        // Same title: skipped.
        let same = post_update(&h, "alice", "D1", Some("Notes"), None)
            .await
            .unwrap();
        assert_eq!(same.status, "skipped");

        // New title: queued and persisted without touching the body.
        let renamed = post_update(&h, "alice", "D1", Some("Renamed"), None)
            .await
            .unwrap();
        assert_eq!(renamed.status, "queued");
        assert!(h.worker.run_once().await.unwrap());

        let snapshot = h.state.content.get("D1").await.unwrap();
        assert_eq!(snapshot.title, "Renamed");
        assert_eq!(snapshot.body, "body");
    }
}
