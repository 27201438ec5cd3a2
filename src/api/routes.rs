//! Router assembly
//!
//! - `/ws` and `/health` are open (the websocket does its own token check
//!   at the handshake)
//! - everything else sits behind the bearer-token middleware

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::auth::auth_middleware;
use super::handlers::{
    active_documents, clear_queue, document_presence, failed_jobs, get_document, health,
    queue_stats, retry_failed_job, update_document,
};
use super::ws::ws_handler;
use crate::app::AppState;

/// Permissive CORS, the browser client lives on another origin.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the complete application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        // Update intake and warm reads
        .route("/documents/:id", post(update_document).get(get_document))
        // Presence views
        .route("/presence", get(active_documents))
        .route("/presence/:document_id", get(document_presence))
        // Queue administration
        .route("/queue/stats", get(queue_stats))
        .route("/queue/failed", get(failed_jobs))
        .route("/queue/failed/:job_id/retry", post(retry_failed_job))
        .route("/queue", delete(clear_queue))
        .layer(from_fn_with_state(Arc::clone(&state), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .merge(protected)
        .layer(cors_layer())
        .with_state(state)
}
