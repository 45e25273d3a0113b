//! In-memory query result cache
//!
//! Maps opaque query keys to their last-known-good result. Entries are
//! overwritten on every successful fetch and judged stale against a TTL at
//! read time; nothing is actively evicted, so the cache is bounded by the
//! application's distinct query-key cardinality.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

#[derive(Debug, Clone)]
struct CacheEntry {
    data: serde_json::Value,
    stored_at: Instant,
}

/// A cache hit, with its staleness already judged against the caller's TTL.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub data: serde_json::Value,
    pub is_stale: bool,
    pub age: Duration,
}

/// Last-known-good store for query results. Owned by the read path; no other
/// component writes to it.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh result, overwriting any previous entry for the key.
    pub fn insert(&self, query_key: &str, data: serde_json::Value) {
        let mut entries = self.entries.write();
        entries.insert(
            query_key.to_string(),
            CacheEntry {
                data,
                stored_at: Instant::now(),
            },
        );
    }

    /// Look up a key, judging staleness against `ttl`.
    pub fn lookup(&self, query_key: &str, ttl: Duration) -> Option<CacheLookup> {
        let entries = self.entries.read();
        let entry = entries.get(query_key)?;
        let age = entry.stored_at.elapsed();
        Some(CacheLookup {
            data: entry.data.clone(),
            is_stale: age > ttl,
            age,
        })
    }

    pub fn contains(&self, query_key: &str) -> bool {
        self.entries.read().contains_key(query_key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
