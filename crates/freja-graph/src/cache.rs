// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;

/// What feeds a node's cache fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKeyStrategy {
    /// Inputs only: identical input replays the cached output even after the
    /// handler code or node config changed.
    Inputs,
    /// Inputs plus the handler's declared code version.
    InputsAndCode,
    /// Inputs, code version, and the node's config value.
    InputsCodeAndConfig,
}

struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

/// Bounded node-output cache with per-entry TTL checked on access; entries
/// past their TTL are evicted and report a miss so the handler recomputes
/// and refreshes.
pub struct NodeCache {
    entries: LruCache<String, CacheEntry>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { entries: LruCache::new(capacity) }
    }

    /// Stable fingerprint for one node execution under `strategy`.
    pub fn fingerprint(
        strategy: CacheKeyStrategy,
        node_id: &str,
        input: &Value,
        code_version: &str,
        config: &Value,
    ) -> String {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(node_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_string(input).unwrap_or_default().as_bytes());
        if matches!(
            strategy,
            CacheKeyStrategy::InputsAndCode | CacheKeyStrategy::InputsCodeAndConfig
        ) {
            hasher.update([1u8]);
            hasher.update(code_version.as_bytes());
        }
        if matches!(strategy, CacheKeyStrategy::InputsCodeAndConfig) {
            hasher.update([2u8]);
            hasher.update(serde_json::to_string(config).unwrap_or_default().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn get(&mut self, key: &str, ttl: Duration) -> Option<Value> {
        match self.entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= ttl => Some(entry.value.clone()),
            Some(_) => {
                self.entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, key: String, value: Value) {
        self.entries.put(key, CacheEntry { value, stored_at: Instant::now() });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn hit_within_ttl_returns_cached_value() {
        let mut cache = NodeCache::new(8);
        cache.put("k".into(), json!("v"));
        assert_eq!(cache.get("k", Duration::from_secs(60)), Some(json!("v")));
    }

    #[test]
    fn entry_past_ttl_is_evicted_on_access() {
        let mut cache = NodeCache::new(8);
        cache.put("k".into(), json!("v"));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get("k", Duration::from_millis(1)), None);
        assert!(cache.is_empty(), "expired entry must be evicted");
    }

    #[test]
    fn refreshed_entry_hits_again() {
        let mut cache = NodeCache::new(8);
        cache.put("k".into(), json!(1));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get("k", Duration::from_millis(1)), None);
        cache.put("k".into(), json!(2));
        assert_eq!(cache.get("k", Duration::from_secs(60)), Some(json!(2)));
    }

    #[test]
    fn strategies_produce_distinct_fingerprints() {
        let input = json!({ "x": 1 });
        let config = json!({ "mode": "fast" });
        let a = NodeCache::fingerprint(CacheKeyStrategy::Inputs, "n", &input, "v1", &config);
        let b = NodeCache::fingerprint(CacheKeyStrategy::InputsAndCode, "n", &input, "v1", &config);
        let c = NodeCache::fingerprint(
            CacheKeyStrategy::InputsCodeAndConfig,
            "n",
            &input,
            "v1",
            &config,
        );
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn inputs_strategy_ignores_code_version() {
        let input = json!([1, 2]);
        let a = NodeCache::fingerprint(CacheKeyStrategy::Inputs, "n", &input, "v1", &json!(null));
        let b = NodeCache::fingerprint(CacheKeyStrategy::Inputs, "n", &input, "v2", &json!(null));
        assert_eq!(a, b);
    }

    #[test]
    fn code_strategy_varies_with_code_version() {
        let input = json!([1, 2]);
        let a =
            NodeCache::fingerprint(CacheKeyStrategy::InputsAndCode, "n", &input, "v1", &json!(null));
        let b =
            NodeCache::fingerprint(CacheKeyStrategy::InputsAndCode, "n", &input, "v2", &json!(null));
        assert_ne!(a, b);
    }

    #[test]
    fn capacity_bounds_the_cache() {
        let mut cache = NodeCache::new(2);
        cache.put("a".into(), json!(1));
        cache.put("b".into(), json!(2));
        cache.put("c".into(), json!(3));
        assert_eq!(cache.len(), 2);
    }
}
