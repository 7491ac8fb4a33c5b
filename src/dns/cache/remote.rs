//! Answer cache in an external key-value store shared across processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, instrument};

use super::{Answer, CacheKey, CacheStats};
use crate::dns::error::CacheError;
use crate::dns::store::RemoteStore;

/// Name of the recency list kept next to the entries.
pub const LRU_LIST: &str = "lru_list";

/// LRU-tracked answer cache living in a [`RemoteStore`].
///
/// Answers are stored under [`CacheKey::cache_string`] as postcard bytes.
/// Every `get` hit and every `put` moves the key to the front of
/// [`LRU_LIST`]; the back of the list is what [`RemoteLruCache::trim`] evicts.
///
/// Entry and recency updates are separate store calls. A crash between them
/// leaves the list out of step with the entries; the list only steers
/// eviction, so that is tolerated.
#[derive(Debug)]
pub struct RemoteLruCache {
    store: Arc<dyn RemoteStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RemoteLruCache {
    #[must_use]
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetches and decodes an answer, marking it most recently used.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the store fails or the entry does not decode.
    #[instrument(level = "debug", skip(self), fields(key = %key.name))]
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Answer>, CacheError> {
        let cache_key = key.cache_string();
        let Some(bytes) = self.store.get(&cache_key).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let answer: Answer = postcard::from_bytes(&bytes).map_err(|source| CacheError::Codec {
            key: cache_key.clone(),
            source,
        })?;

        self.touch(&cache_key).await?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(answer))
    }

    /// Stores an answer, marking it most recently used.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding or the store fails.
    #[instrument(level = "debug", skip(self, answer), fields(key = %key.name))]
    pub async fn put(&self, key: &CacheKey, answer: &Answer) -> Result<(), CacheError> {
        let cache_key = key.cache_string();
        let bytes = postcard::to_allocvec(answer).map_err(|source| CacheError::Codec {
            key: cache_key.clone(),
            source,
        })?;
        self.store.set(&cache_key, &bytes).await?;
        self.touch(&cache_key).await
    }

    /// Removes one entry and its recency record, or everything when `key`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the store fails.
    pub async fn flush(&self, key: Option<&CacheKey>) -> Result<(), CacheError> {
        match key {
            Some(key) => {
                let cache_key = key.cache_string();
                self.store.delete(&cache_key).await?;
                self.store.list_remove(LRU_LIST, &cache_key).await?;
            }
            None => self.store.flush_all().await?,
        }
        Ok(())
    }

    /// Evicts least recently used entries until at most `max_entries`
    /// remain on the recency list. Returns the number of evicted entries.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the store fails.
    pub async fn trim(&self, max_entries: usize) -> Result<usize, CacheError> {
        let mut evicted = 0;
        while self.store.list_len(LRU_LIST).await? > max_entries {
            let Some(cache_key) = self.store.list_pop_back(LRU_LIST).await? else {
                break;
            };
            self.store.delete(&cache_key).await?;
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, max_entries, "trimmed remote DNS cache");
        }
        Ok(evicted)
    }

    /// Store keys from most to least recently used.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the store fails.
    pub async fn recency(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.store.list_range(LRU_LIST).await?)
    }

    /// Number of entries in the store.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the store fails.
    pub async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.store.size().await?)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    async fn touch(&self, cache_key: &str) -> Result<(), CacheError> {
        self.store.list_remove(LRU_LIST, cache_key).await?;
        self.store.list_push_front(LRU_LIST, cache_key).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dns::store::MemoryStore;

    fn answer(name: &str, ip: &str) -> Answer {
        Answer {
            name: name.to_string(),
            addresses: vec![ip.parse().unwrap()],
            ttl: Some(300),
            nameserver: Some("8.8.8.8".parse().unwrap()),
        }
    }

    fn cache() -> (RemoteLruCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (RemoteLruCache::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_put_then_get_round_trips() {
        let (cache, _) = cache();
        let key = CacheKey::address("img.example");
        let value = answer("img.example.", "203.0.113.7");

        cache.put(&key, &value).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_get_unknown_counts_miss() {
        let (cache, _) = cache();
        assert!(cache.get(&CacheKey::address("nope")).await.unwrap().is_none());
        assert_eq!(cache.stats(), CacheStats { hits: 0, misses: 1 });
    }

    #[tokio::test]
    async fn test_get_hit_counts_and_moves_to_front() {
        let (cache, _) = cache();
        let a = CacheKey::address("a.example");
        let b = CacheKey::address("b.example");
        cache.put(&a, &answer("a.example.", "10.0.0.1")).await.unwrap();
        cache.put(&b, &answer("b.example.", "10.0.0.2")).await.unwrap();
        assert_eq!(cache.recency().await.unwrap()[0], b.cache_string());

        cache.get(&a).await.unwrap();

        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 0 });
        assert_eq!(
            cache.recency().await.unwrap(),
            vec![a.cache_string(), b.cache_string()]
        );
    }

    #[tokio::test]
    async fn test_repeated_put_keeps_single_recency_record() {
        let (cache, _) = cache();
        let a = CacheKey::address("a.example");
        cache.put(&a, &answer("a.example.", "10.0.0.1")).await.unwrap();
        cache.put(&a, &answer("a.example.", "10.0.0.1")).await.unwrap();
        assert_eq!(cache.recency().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_key_removes_entry_and_recency() {
        let (cache, _) = cache();
        let a = CacheKey::address("a.example");
        let b = CacheKey::address("b.example");
        cache.put(&a, &answer("a.example.", "10.0.0.1")).await.unwrap();
        cache.put(&b, &answer("b.example.", "10.0.0.2")).await.unwrap();

        cache.flush(Some(&a)).await.unwrap();

        assert!(cache.get(&a).await.unwrap().is_none());
        assert_eq!(cache.recency().await.unwrap(), vec![b.cache_string()]);
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flush_all_empties_store_and_list() {
        let (cache, _) = cache();
        cache
            .put(&CacheKey::address("a"), &answer("a.", "10.0.0.1"))
            .await
            .unwrap();
        cache.flush(None).await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 0);
        assert!(cache.recency().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trim_evicts_least_recent() {
        let (cache, _) = cache();
        for i in 0..5 {
            let name = format!("h{i}.example");
            cache
                .put(&CacheKey::address(&name), &answer(&name, "10.0.0.1"))
                .await
                .unwrap();
        }
        // touch h0 so it survives
        cache.get(&CacheKey::address("h0.example")).await.unwrap();

        let evicted = cache.trim(2).await.unwrap();

        assert_eq!(evicted, 3);
        assert_eq!(cache.len().await.unwrap(), 2);
        assert!(cache.get(&CacheKey::address("h0.example")).await.unwrap().is_some());
        assert!(cache.get(&CacheKey::address("h4.example")).await.unwrap().is_some());
        assert!(cache.get(&CacheKey::address("h1.example")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_codec_error() {
        let (cache, store) = cache();
        let key = CacheKey::address("bad.example");
        store.set(&key.cache_string(), &[0xff, 0xff, 0xff]).await.unwrap();
        let err = cache.get(&key).await.unwrap_err();
        assert!(matches!(err, CacheError::Codec { .. }));
    }
}
