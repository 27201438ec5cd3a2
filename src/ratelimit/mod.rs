//! Per-principal message rate limiting
//!
//! Admits or rejects a realtime message before it consumes any further
//! resources. Windows and blocks live in the shared cache store so limits
//! hold across gateway instances:
//!
//! - `rate_limit:{principal}:{type}`: sorted set of request timestamps
//! - `rate_limit_block:{principal}:{type}`: temporary blocked-until mark
//!
//! If the store is unreachable the limiter fails open: correctness of
//! collaboration outweighs adversarial throttling.

mod limiter;
mod policy;

pub use limiter::{AdmitDecision, RateLimiter};
pub use policy::{RateLimitPolicy, RateLimitTable};

use thiserror::Error;

/// Rate limiter errors
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Result type for rate limiter operations
pub type RateLimitResult<T> = Result<T, RateLimitError>;
