//! Application wiring and lifecycle
//!
//! [`HubApp`] assembles the hub from its configuration: picks the store
//! and document-gateway backends, builds the realtime gateway and the
//! queue worker, serves the router, and tears everything down in order on
//! shutdown.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;

use crate::api::{create_router, TokenVerifier};
use crate::bus::DocumentBus;
use crate::config::HubConfig;
use crate::content::ContentCache;
use crate::documents::{DocumentGateway, MemoryDocumentGateway, PgDocumentGateway};
use crate::gateway::CollabGateway;
use crate::presence::PresenceRegistry;
use crate::queue::{PersistenceQueue, QueueWorker};
use crate::ratelimit::RateLimiter;
use crate::store::{CacheStore, MemoryStore, RedisStore};

/// Shared state handed to every handler.
pub struct AppState {
    pub config: HubConfig,
    pub store: Arc<dyn CacheStore>,
    pub presence: Arc<PresenceRegistry>,
    pub content: Arc<ContentCache>,
    pub queue: Arc<PersistenceQueue>,
    pub documents: Arc<dyn DocumentGateway>,
    pub gateway: Arc<CollabGateway>,
    pub verifier: Arc<TokenVerifier>,
    pub started_at: Instant,
}

/// The assembled hub.
pub struct HubApp {
    state: Arc<AppState>,
    worker: Arc<QueueWorker>,
}

impl HubApp {
    /// Wire every component from configuration. A store or database that
    /// cannot be reached at startup is fatal.
    pub async fn new(config: HubConfig) -> anyhow::Result<Self> {
        log::info!("initializing synchub v{}", env!("CARGO_PKG_VERSION"));

        let store: Arc<dyn CacheStore> = match &config.redis_url {
            Some(url) => {
                log::info!("connecting to redis at {}", url);
                Arc::new(
                    RedisStore::connect(url)
                        .await
                        .context("redis connection failed")?,
                )
            }
            None => {
                log::warn!("REDIS_URL not set, using in-process store (single node only)");
                Arc::new(MemoryStore::new())
            }
        };

        let documents: Arc<dyn DocumentGateway> = match &config.database_url {
            Some(url) => {
                log::info!("connecting to database");
                Arc::new(
                    PgDocumentGateway::connect(url)
                        .await
                        .context("database connection failed")?,
                )
            }
            None => {
                log::warn!("DATABASE_URL not set, using in-process document gateway");
                Arc::new(MemoryDocumentGateway::new())
            }
        };

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

        let worker = Arc::new(QueueWorker::new(
            Arc::clone(&queue),
            Arc::clone(&documents),
            Arc::clone(&content),
            config.queue_tick,
            config.job_timeout,
        ));

        let state = Arc::new(AppState {
            config,
            store,
            presence,
            content,
            queue,
            documents,
            gateway,
            verifier,
            started_at: Instant::now(),
        });

        Ok(Self { state, worker })
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Serve until ctrl-c, then drain and stop.
    pub async fn run(self) -> anyhow::Result<()> {
        self.state.gateway.start_maintenance(
            self.state.config.limiter_gc_every,
            self.state.config.stale_sweep_every,
        );
        self.worker.start().await;

        let addr = self.state.config.server_address();
        let router = create_router(Arc::clone(&self.state));
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        log::info!("listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.shutdown().await;
        Ok(())
    }

    /// Ordered teardown: stop polling for new jobs (the in-flight one
    /// drains), then close sockets, relays and maintenance.
    pub async fn shutdown(&self) {
        log::info!("shutting down");
        self.worker.stop().await;
        self.state.gateway.shutdown().await;
        log::info!("shutdown complete");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to install ctrl-c handler: {}", e);
    }
}
