//! Hub configuration
//!
//! Environment-driven with typed defaults. Anything malformed is a
//! startup-fatal error; the process refuses to start on bad configuration
//! rather than limping with surprising values.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::{RateLimitPolicy, RateLimitTable};

/// Configuration errors. All fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Complete hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Server bind address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Redis connection URL; absent runs the in-process store (single
    /// node, no cross-instance fan-out)
    pub redis_url: Option<String>,
    /// PostgreSQL connection URL; absent runs the in-process document
    /// gateway
    pub database_url: Option<String>,
    /// Shared HS256 secret for bearer-token verification
    pub jwt_secret: String,
    /// Rate limit for CRDT update frames
    pub rate_limit_crdt: RateLimitPolicy,
    /// Rate limit for awareness frames
    pub rate_limit_awareness: RateLimitPolicy,
    /// Presence hash TTL
    pub session_ttl: Duration,
    /// Content snapshot TTL
    pub cache_ttl: Duration,
    /// Persistence job attempt budget
    pub queue_max_attempts: u32,
    /// Delay before a failed job is retried
    pub queue_backoff_ms: u64,
    /// Worker poll interval
    pub queue_tick: Duration,
    /// Soft per-job timeout
    pub job_timeout: Duration,
    /// Presence stale-sweep interval
    pub stale_sweep_every: Duration,
    /// Rate-limiter garbage-collection interval
    pub limiter_gc_every: Duration,
}

impl HubConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or("HOST", "0.0.0.0"),
            port: parse_env("PORT", 8080)?,
            redis_url: std::env::var("REDIS_URL").ok(),
            database_url: std::env::var("DATABASE_URL").ok(),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| ConfigError::Missing("JWT_SECRET"))?,
            rate_limit_crdt: parse_policy_env(
                "RATE_LIMIT_CRDT",
                RateLimitPolicy::new(50, 1_000, 5_000),
            )?,
            rate_limit_awareness: parse_policy_env(
                "RATE_LIMIT_AWARENESS",
                RateLimitPolicy::new(30, 1_000, 3_000),
            )?,
            session_ttl: Duration::from_secs(parse_env("SESSION_TTL_SECS", 300)?),
            cache_ttl: Duration::from_secs(parse_env("CACHE_TTL_SECS", 3_600)?),
            queue_max_attempts: parse_env("QUEUE_MAX_ATTEMPTS", 3)?,
            queue_backoff_ms: parse_env("QUEUE_BACKOFF_MS", 5_000)?,
            queue_tick: Duration::from_millis(parse_env("QUEUE_TICK_MS", 1_000)?),
            job_timeout: Duration::from_millis(parse_env("JOB_TIMEOUT_MS", 30_000)?),
            stale_sweep_every: Duration::from_millis(parse_env("STALE_SWEEP_MS", 600_000)?),
            limiter_gc_every: Duration::from_millis(parse_env("LIMITER_GC_MS", 300_000)?),
        })
    }

    /// Server address as `host:port`.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rate-limit table built from the configured policies. Every other
    /// message type is unlimited.
    pub fn rate_limit_table(&self) -> RateLimitTable {
        let mut table = RateLimitTable::unlimited();
        table.set("crdt-update", self.rate_limit_crdt);
        table.set("awareness-update", self.rate_limit_awareness);
        table
    }

    /// A fixed configuration for tests: in-process backends, permissive
    /// defaults.
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            redis_url: None,
            database_url: None,
            jwt_secret: jwt_secret.to_string(),
            rate_limit_crdt: RateLimitPolicy::new(50, 1_000, 5_000),
            rate_limit_awareness: RateLimitPolicy::new(30, 1_000, 3_000),
            session_ttl: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(3_600),
            queue_max_attempts: 3,
            queue_backoff_ms: 0,
            queue_tick: Duration::from_millis(20),
            job_timeout: Duration::from_secs(30),
            stale_sweep_every: Duration::from_secs(600),
            limiter_gc_every: Duration::from_secs(300),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw,
        }),
    }
}

/// Policies are written `max:window_ms:block_ms`, e.g. `50:1000:5000`.
fn parse_policy_env(
    name: &'static str,
    default: RateLimitPolicy,
) -> Result<RateLimitPolicy, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };

    let invalid = || ConfigError::Invalid {
        name,
        value: raw.clone(),
    };

    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }

    Ok(RateLimitPolicy::new(
        parts[0].parse().map_err(|_| invalid())?,
        parts[1].parse().map_err(|_| invalid())?,
        parts[2].parse().map_err(|_| invalid())?,
    ))
}
