//! Sliding-window rate limiter with temporary blocks

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;

use super::{RateLimitResult, RateLimitTable};
use crate::store::CacheStore;

/// Timestamps older than this are garbage collected from the windows.
const GC_MAX_AGE_MS: i64 = 60 * 60 * 1_000;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitDecision {
    /// Whether the message may proceed
    pub admitted: bool,
    /// Admissions left in the current window
    pub remaining: u32,
    /// Epoch ms when the current window resets
    pub reset_at: i64,
    /// Epoch ms until which the principal is blocked, if a block is active
    pub blocked_until: Option<i64>,
}

impl AdmitDecision {
    fn open(policy_max: u32, now_ms: i64, window_ms: u64) -> Self {
        Self {
            admitted: true,
            remaining: policy_max,
            reset_at: now_ms + window_ms as i64,
            blocked_until: None,
        }
    }
}

/// Distributed sliding-window limiter.
///
/// One sorted set of timestamps per `(principal, message type)` pair; a
/// rejection that fills the window installs a blocked-until mark that
/// short-circuits further checks until it expires.
pub struct RateLimiter {
    store: Arc<dyn CacheStore>,
    table: RateLimitTable,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CacheStore>, table: RateLimitTable) -> Self {
        Self { store, table }
    }

    pub fn table(&self) -> &RateLimitTable {
        &self.table
    }

    /// Admit or reject one message. Appends to the window on admission;
    /// the blocked path has no side effects and is idempotent.
    ///
    /// Store failures admit the message: a broken limiter must not break
    /// collaboration.
    pub async fn check_and_admit(&self, principal_id: &str, message_type: &str) -> AdmitDecision {
        let now_ms = Utc::now().timestamp_millis();

        let Some(policy) = self.table.get(message_type) else {
            return AdmitDecision::open(u32::MAX, now_ms, 0);
        };

        match self
            .check_inner(principal_id, message_type, policy, now_ms)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                log::warn!(
                    "rate limiter failing open for {} ({}): {}",
                    principal_id,
                    message_type,
                    e
                );
                AdmitDecision::open(policy.max_messages, now_ms, policy.window_ms)
            }
        }
    }

    async fn check_inner(
        &self,
        principal_id: &str,
        message_type: &str,
        policy: super::RateLimitPolicy,
        now_ms: i64,
    ) -> RateLimitResult<AdmitDecision> {
        let window_key = window_key(principal_id, message_type);
        let block_key = block_key(principal_id, message_type);

        // 1. An active block rejects without touching the window.
        if let Some(raw) = self.store.get(&block_key).await? {
            if let Ok(blocked_until) = raw.parse::<i64>() {
                if blocked_until > now_ms {
                    return Ok(AdmitDecision {
                        admitted: false,
                        remaining: 0,
                        reset_at: blocked_until,
                        blocked_until: Some(blocked_until),
                    });
                }
            }
        }

        // 2. Count the window; a full window installs a block.
        let window_start = now_ms - policy.window_ms as i64;
        let count = self
            .store
            .zcount(&window_key, window_start as f64, now_ms as f64)
            .await? as u32;

        if count >= policy.max_messages {
            let blocked_until = now_ms + policy.block_ms as i64;
            // Round the key TTL up so the block mark cannot expire before
            // the block itself.
            let ttl_secs = ((policy.block_ms + 999) / 1_000).max(1);
            self.store
                .set_ex(&block_key, &blocked_until.to_string(), ttl_secs)
                .await?;

            return Ok(AdmitDecision {
                admitted: false,
                remaining: 0,
                reset_at: blocked_until,
                blocked_until: Some(blocked_until),
            });
        }

        // 3. Admit and record.
        let member = window_member(now_ms);
        self.store.zadd(&window_key, now_ms as f64, &member).await?;

        Ok(AdmitDecision {
            admitted: true,
            remaining: policy.max_messages.saturating_sub(count + 1),
            reset_at: now_ms + policy.window_ms as i64,
            blocked_until: None,
        })
    }

    /// Drop window entries older than one hour and delete empty buckets.
    /// Runs from the gateway's periodic duties.
    pub async fn collect_garbage(&self) -> RateLimitResult<usize> {
        let cutoff = Utc::now().timestamp_millis() - GC_MAX_AGE_MS;
        let keys = self.store.keys_with_prefix("rate_limit:").await?;

        let mut dropped = 0;
        for key in keys {
            self.store
                .zrem_range_by_score(&key, 0.0, cutoff as f64)
                .await?;
            if self.store.zcard(&key).await? == 0 {
                self.store.del(&key).await?;
                dropped += 1;
            }
        }

        log::debug!("rate limiter gc dropped {} empty buckets", dropped);
        Ok(dropped)
    }
}

fn window_key(principal_id: &str, message_type: &str) -> String {
    format!("rate_limit:{}:{}", principal_id, message_type)
}

fn block_key(principal_id: &str, message_type: &str) -> String {
    format!("rate_limit_block:{}:{}", principal_id, message_type)
}

/// Sorted-set members must be unique even when two messages land in the
/// same millisecond.
fn window_member(now_ms: i64) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{:08x}", now_ms, suffix)
}
