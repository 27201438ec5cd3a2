//! Rate-limit policies per message type

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Limit applied to one message type for one principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum messages admitted inside the window
    pub max_messages: u32,
    /// Sliding window length in milliseconds
    pub window_ms: u64,
    /// Block duration applied once the window is exceeded
    pub block_ms: u64,
}

impl RateLimitPolicy {
    pub fn new(max_messages: u32, window_ms: u64, block_ms: u64) -> Self {
        Self {
            max_messages,
            window_ms,
            block_ms,
        }
    }
}

/// Table mapping message type to its policy. Types without an entry are
/// unlimited.
#[derive(Debug, Clone, Default)]
pub struct RateLimitTable {
    policies: HashMap<String, RateLimitPolicy>,
}

impl RateLimitTable {
    /// Empty table; every message type is unlimited.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Production defaults: CRDT updates 50/s with a 5 s block, awareness
    /// 30/s with a 3 s block.
    pub fn with_defaults() -> Self {
        let mut table = Self::default();
        table.set("crdt-update", RateLimitPolicy::new(50, 1_000, 5_000));
        table.set("awareness-update", RateLimitPolicy::new(30, 1_000, 3_000));
        table
    }

    /// Install or replace the policy for a message type.
    pub fn set(&mut self, message_type: &str, policy: RateLimitPolicy) {
        self.policies.insert(message_type.to_string(), policy);
    }

    pub fn get(&self, message_type: &str) -> Option<RateLimitPolicy> {
        self.policies.get(message_type).copied()
    }

    pub fn is_limited(&self, message_type: &str) -> bool {
        self.policies.contains_key(message_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let table = RateLimitTable::with_defaults();

        let crdt = table.get("crdt-update").unwrap();
        assert_eq!(crdt.max_messages, 50);
        assert_eq!(crdt.window_ms, 1_000);
        assert_eq!(crdt.block_ms, 5_000);

        let awareness = table.get("awareness-update").unwrap();
        assert_eq!(awareness.max_messages, 30);

        assert!(!table.is_limited("join-document"));
    }

    #[test]
    fn test_set_overrides() {
        let mut table = RateLimitTable::with_defaults();
        table.set("crdt-update", RateLimitPolicy::new(3, 1_000, 2_000));

        assert_eq!(table.get("crdt-update").unwrap().max_messages, 3);
    }
}
