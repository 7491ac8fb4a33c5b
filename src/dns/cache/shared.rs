//! Process-wide merge-on-write answer map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Answer, CacheKey, CacheStats};

/// One answer map shared by every worker in the process.
///
/// Writes never overwrite: [`SharedCache::merge`] only inserts keys that are
/// not present yet, so an answer already cached by a faster worker is not
/// clobbered by a slower concurrent resolution of the same name.
#[derive(Debug, Default)]
pub struct SharedCache {
    data: Mutex<HashMap<CacheKey, Answer>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SharedCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Answer> {
        let answer = self.lock().get(key).cloned();
        if answer.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        answer
    }

    /// Single-entry merge: inserts only if `key` is absent.
    pub fn put(&self, key: CacheKey, answer: Answer) {
        self.lock().entry(key).or_insert(answer);
    }

    /// Adds every entry of `new_entries` whose key is not cached yet.
    /// Returns how many entries were added.
    pub fn merge(&self, new_entries: HashMap<CacheKey, Answer>) -> usize {
        let mut data = self.lock();
        let before = data.len();
        for (key, answer) in new_entries {
            data.entry(key).or_insert(answer);
        }
        data.len() - before
    }

    /// Copy of the current entries.
    ///
    /// Not authoritative: workers keep merging while the caller holds the
    /// copy, so it may already be stale when used. Use it for statistics and
    /// snapshots, never as the source of truth.
    #[must_use]
    pub fn dump(&self) -> HashMap<CacheKey, Answer> {
        self.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Answer>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn answer(ip: &str) -> Answer {
        Answer {
            name: "x.".to_string(),
            addresses: vec![ip.parse().unwrap()],
            ttl: None,
            nameserver: None,
        }
    }

    #[test]
    fn test_merge_is_first_writer_wins_union() {
        let cache = SharedCache::new();
        cache.put(CacheKey::address("a"), answer("10.0.0.1"));
        cache.put(CacheKey::address("b"), answer("10.0.0.2"));
        let before = cache.dump();

        let mut incoming = HashMap::new();
        incoming.insert(CacheKey::address("a"), answer("192.168.0.1"));
        incoming.insert(CacheKey::address("c"), answer("10.0.0.3"));
        let added = cache.merge(incoming.clone());

        assert_eq!(added, 1);
        let after = cache.dump();
        for (key, value) in &before {
            assert_eq!(after.get(key), Some(value), "existing key changed");
        }
        let mut expected_keys: Vec<_> = before.keys().chain(incoming.keys()).cloned().collect();
        expected_keys.sort_by(|a, b| a.name.cmp(&b.name));
        expected_keys.dedup();
        assert_eq!(after.len(), expected_keys.len());
        for key in expected_keys {
            assert!(after.contains_key(&key));
        }
    }

    #[test]
    fn test_put_does_not_overwrite() {
        let cache = SharedCache::new();
        let key = CacheKey::address("a");
        cache.put(key.clone(), answer("10.0.0.1"));
        cache.put(key.clone(), answer("10.0.0.9"));
        assert_eq!(cache.get(&key), Some(answer("10.0.0.1")));
    }

    #[test]
    fn test_get_counts_hits_and_misses() {
        let cache = SharedCache::new();
        cache.put(CacheKey::address("a"), answer("10.0.0.1"));
        let _ = cache.get(&CacheKey::address("a"));
        let _ = cache.get(&CacheKey::address("z"));
        let _ = cache.get(&CacheKey::address("z"));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 2 });
    }

    #[test]
    fn test_concurrent_merges_keep_first_value() {
        let cache = Arc::new(SharedCache::new());
        let mut handles = Vec::new();
        for t in 0..8u8 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                let mut batch = HashMap::new();
                for i in 0..50u8 {
                    batch.insert(
                        CacheKey::address(&format!("host{i}")),
                        answer(&format!("10.0.{t}.{i}")),
                    );
                }
                cache.merge(batch);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 50);
        let snapshot = cache.dump();
        let first = snapshot.get(&CacheKey::address("host0")).unwrap().clone();
        cache.merge(HashMap::from([(CacheKey::address("host0"), answer("1.2.3.4"))]));
        assert_eq!(cache.get(&CacheKey::address("host0")), Some(first));
    }
}
