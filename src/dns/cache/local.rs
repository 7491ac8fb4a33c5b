//! Unshared per-worker answer map.

use std::collections::HashMap;

use super::{Answer, CacheKey, CacheStats};

/// Plain map owned by a single worker. No lock, no eviction.
///
/// Entries are handed to a shared aggregator with [`LocalCache::dump`], which
/// drains the map.
#[derive(Debug, Default)]
pub struct LocalCache {
    data: HashMap<CacheKey, Answer>,
    stats: CacheStats,
}

impl LocalCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<Answer> {
        let answer = self.data.get(key).cloned();
        if answer.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        answer
    }

    pub fn put(&mut self, key: CacheKey, answer: Answer) {
        self.data.insert(key, answer);
    }

    /// Returns every entry and leaves the cache empty.
    pub fn dump(&mut self) -> HashMap<CacheKey, Answer> {
        std::mem::take(&mut self.data)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
