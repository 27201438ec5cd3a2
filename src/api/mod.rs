//! HTTP and WebSocket surface
//!
//! This module provides:
//! - the `/ws` realtime endpoint (token-checked upgrade)
//! - the update intake `POST /documents/{id}`
//! - warm document reads, presence views, queue administration
//! - bearer-token auth middleware and RFC 7807 error responses

pub mod auth;
pub mod handlers;
pub mod responses;
pub mod routes;
pub mod ws;

pub use auth::TokenVerifier;
pub use responses::ApiError;
pub use routes::create_router;
