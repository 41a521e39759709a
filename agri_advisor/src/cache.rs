//! Bounded LRU cache for generated text, shared across concurrent queries.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::llm::ModelRole;

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: Mutex<LruCache<String, String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(non_zero(capacity))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key over the whitespace-normalized prompt, role and temperature.
    pub fn key(prompt: &str, role: ModelRole, temperature: f32) -> String {
        let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut hasher = blake3::Hasher::new();
        hasher.update(role.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(format!("{temperature:.3}").as_bytes());
        hasher.update(b"\x1f");
        hasher.update(normalized.as_bytes());
        format!("gen:{}", hasher.finalize().to_hex())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let found = self.entries.lock().get(key).cloned();
        match found {
            Some(text) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(text)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Same key always maps to the same text, so a racing overwrite is harmless.
    pub fn insert(&self, key: String, text: String) {
        self.entries.lock().put(key, text);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!("Response cache cleared");
    }

    pub fn resize(&self, capacity: usize) {
        let mut entries = self.entries.lock();
        if entries.cap().get() != capacity.max(1) {
            entries.resize(non_zero(capacity));
            debug!(capacity, "Response cache resized");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, capacity) = {
            let guard = self.entries.lock();
            (guard.len(), guard.cap().get())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            entries,
            capacity,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

pub(crate) fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}
