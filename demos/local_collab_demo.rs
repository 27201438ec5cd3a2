//! Local collaboration walkthrough
//!
//! Drives the full hub in a single process with the in-memory backends:
//! two clients join a document, exchange CRDT and awareness updates, and a
//! save travels the intake -> queue -> worker -> content cache path.
//!
//! Run with: `cargo run --example local_collab_demo`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use synchub::bus::DocumentBus;
use synchub::content::ContentCache;
use synchub::documents::{DocumentGateway, MemoryDocumentGateway};
use synchub::gateway::{CollabGateway, Principal, OUTBOUND_BUFFER};
use synchub::presence::PresenceRegistry;
use synchub::queue::{
    DocumentUpdatePayload, DocumentUpdates, PersistenceQueue, QueueJob, QueueWorker,
    DOCUMENT_UPDATE_JOB,
};
use synchub::ratelimit::{RateLimitTable, RateLimiter};
use synchub::store::{CacheStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let presence = Arc::new(PresenceRegistry::new(
        Arc::clone(&store),
        Duration::from_secs(300),
    ));
    let bus = Arc::new(DocumentBus::new(Arc::clone(&store)));
    let limiter = Arc::new(RateLimiter::new(
        Arc::clone(&store),
        RateLimitTable::with_defaults(),
    ));
    let gateway = CollabGateway::new(Arc::clone(&presence), bus, limiter);

    let documents = Arc::new(MemoryDocumentGateway::new());
    documents.insert_document("design-doc", "alice", "Design Notes", "initial body");
    documents.grant_edit("design-doc", "bob");

    let content = Arc::new(ContentCache::new(
        Arc::clone(&store),
        Duration::from_secs(3600),
    ));
    let queue = Arc::new(PersistenceQueue::new(Arc::clone(&store)));
    let worker = QueueWorker::new(
        Arc::clone(&queue),
        Arc::clone(&documents) as Arc<dyn DocumentGateway>,
        Arc::clone(&content),
        Duration::from_millis(100),
        Duration::from_secs(30),
    );

    // Two clients connect and join the same document.
    let (alice_tx, mut alice_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let alice = gateway.register_connection(
        Principal {
            principal_id: "alice".to_string(),
            display_name: "Alice".to_string(),
        },
        alice_tx,
    );

    let (bob_tx, mut bob_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let bob = gateway.register_connection(
        Principal {
            principal_id: "bob".to_string(),
            display_name: "Bob".to_string(),
        },
        bob_tx,
    );

    gateway
        .handle_frame(
            &alice,
            r#"{"type":"join-document","data":{"documentId":"design-doc"}}"#,
        )
        .await;
    gateway
        .handle_frame(
            &bob,
            r#"{"type":"join-document","data":{"documentId":"design-doc"}}"#,
        )
        .await;

    println!("== membership ==");
    for session in presence.list_sessions("design-doc").await? {
        println!("  {} ({})", session.display_name, session.socket_id);
    }

    // Alice broadcasts an update; only Bob receives it.
    gateway
        .handle_frame(
            &alice,
            r#"{"type":"crdt-update","data":{"documentId":"design-doc","update":"AAECAwQ="}}"#,
        )
        .await;

    println!("== frames seen by bob ==");
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(200), bob_rx.recv()).await
    {
        println!("  {}", frame);
    }

    println!("== frames seen by alice (no self-echo expected) ==");
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(200), alice_rx.recv()).await
    {
        println!("  {}", frame);
    }

    // A save travels the asynchronous persistence path.
    let payload = DocumentUpdatePayload {
        document_id: "design-doc".to_string(),
        principal_id: "alice".to_string(),
        updates: DocumentUpdates {
            title: None,
            body: Some("body after the editing session".to_string()),
        },
        metadata: serde_json::json!({ "source": "demo" }),
    };
    let job = QueueJob::new(
        DOCUMENT_UPDATE_JOB,
        serde_json::to_value(&payload)?,
        3,
        5_000,
    );
    let job_id = queue.enqueue(job).await?;
    println!("== enqueued {} ==", job_id);

    worker.run_once().await?;

    let snapshot = content
        .get("design-doc")
        .await
        .expect("worker refreshed the cache");
    println!("== persisted snapshot ==");
    println!("  title: {}", snapshot.title);
    println!("  body: {}", snapshot.body);
    println!("  history entries: {}", documents.history().len());

    Ok(())
}
