//! Fingerprint-keyed response cache
//!
//! Entries are keyed by a SHA-256 fingerprint of the operation and its
//! canonical parameters, carry a per-operation TTL, and are bounded in
//! count with LRU eviction under pressure. Expired entries are treated as
//! misses and removed lazily.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::Operation;

/// Compute the fingerprint for an operation and its canonical parameters.
///
/// `serde_json` serializes object keys in sorted order, so semantically
/// equal parameter objects produce identical fingerprints regardless of
/// construction order. Credentials never participate in the key.
#[must_use]
pub fn fingerprint(operation: Operation, params: &Value) -> String {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(operation.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// A cached normalized payload
#[derive(Debug, Clone)]
pub struct CachedPayload {
    /// Normalized operation result
    pub data: Value,
    /// Provider that originally produced the data
    pub origin: String,
    /// When the data was fetched upstream
    pub fetched_at: DateTime<Utc>,
}

struct CacheEntry {
    payload: CachedPayload,
    expires_at: Instant,
    last_used: u64,
}

/// Bounded TTL + LRU cache over fingerprints
pub struct AggregatorCache {
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// LRU clock; bumped on every access
    tick: AtomicU64,
}

impl AggregatorCache {
    /// Create a cache bounded to `max_entries`
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
        }
    }

    /// Fresh payload for a fingerprint, or `None` on miss/expiry
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedPayload> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_used = self.tick.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a payload with the given TTL, evicting the least-recently-used
    /// entry when the bound is reached
    pub fn insert(&self, key: String, payload: CachedPayload, ttl: Duration) {
        let mut entries = self.entries.lock();

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            // Drop expired entries first; fall back to LRU eviction.
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
            while entries.len() >= self.max_entries {
                let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                payload,
                expires_at: Instant::now() + ttl,
                last_used: self.tick.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    /// Current entry count (expired entries included until touched)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
