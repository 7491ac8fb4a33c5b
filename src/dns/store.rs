//! Key-value stores backing [`RemoteLruCache`](super::cache::RemoteLruCache).
//!
//! The cache needs plain get/set/delete on binary values plus a few list
//! operations for its recency list. [`RedisStore`] keeps both on a Redis
//! server shared by every worker node; [`SqliteStore`] keeps them in a SQLite
//! file that survives restarts and can be opened by every worker process on
//! one host; [`MemoryStore`] keeps them in process memory.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use sqlx::sqlite::SqlitePool;
use tracing::{info, instrument};
use url::Url;

use super::cache::LRU_LIST;
use super::error::StoreError;
use crate::db;

/// Operations the remote answer cache needs from its store.
///
/// Implementations must be safe to share between workers and processes;
/// the cache relies on the store's own concurrency guarantees.
#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Pushes `value` onto the front (most recent end) of `list`.
    async fn list_push_front(&self, list: &str, value: &str) -> Result<(), StoreError>;
    /// Removes every occurrence of `value` from `list`.
    async fn list_remove(&self, list: &str, value: &str) -> Result<(), StoreError>;
    /// Pops the back (least recent end) of `list`.
    async fn list_pop_back(&self, list: &str) -> Result<Option<String>, StoreError>;
    async fn list_len(&self, list: &str) -> Result<usize, StoreError>;
    /// Whole list, front first.
    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError>;
    /// Number of stored values (lists excluded).
    async fn size(&self) -> Result<usize, StoreError>;
    /// Deletes all values and all lists.
    async fn flush_all(&self) -> Result<(), StoreError>;
}

/// In-process store. Shares entries only between holders of the same `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, Vec<u8>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.lock().values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().values.remove(key);
        Ok(())
    }

    async fn list_push_front(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<(), StoreError> {
        if let Some(entries) = self.lock().lists.get_mut(list) {
            entries.retain(|entry| entry != value);
        }
        Ok(())
    }

    async fn list_pop_back(&self, list: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .lists
            .get_mut(list)
            .and_then(VecDeque::pop_back))
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        Ok(self.lock().lists.get(list).map_or(0, VecDeque::len))
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .lists
            .get(list)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn size(&self) -> Result<usize, StoreError> {
        Ok(self.lock().values.len())
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.values.clear();
        state.lists.clear();
        Ok(())
    }
}

/// SQLite-file store.
///
/// Lists are rows ordered by an autoincrement id: the highest id is the
/// front, the lowest id the back.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] if the file cannot be opened or migrated.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            pool: db::open_pool(path).await?,
        })
    }

    #[cfg(test)]
    async fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            pool: db::open_in_memory_pool().await?,
        })
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM dns_cache_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO dns_cache_entries (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dns_cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_push_front(&self, list: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO dns_cache_lists (list, value) VALUES (?, ?)")
            .bind(list)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dns_cache_lists WHERE list = ? AND value = ?")
            .bind(list)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_pop_back(&self, list: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "DELETE FROM dns_cache_lists WHERE id = \
             (SELECT MIN(id) FROM dns_cache_lists WHERE list = ?) RETURNING value",
        )
        .bind(list)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dns_cache_lists WHERE list = ?")
            .bind(list)
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT value FROM dns_cache_lists WHERE list = ? ORDER BY id DESC")
                .bind(list)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(value,)| value).collect())
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dns_cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dns_cache_entries")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dns_cache_lists")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Port assumed when a cache host names none.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Connection URL for a configured cache host.
///
/// Accepts a bare host (`cache.internal`), a host with port, or a full
/// `redis://` / `rediss://` URL. Returns `None` for anything else.
#[must_use]
pub fn redis_url(host: &str) -> Option<String> {
    let host = host.trim();
    let raw = if host.contains("://") {
        host.to_string()
    } else {
        format!("redis://{host}")
    };
    let mut url = Url::parse(&raw).ok()?;
    if !matches!(url.scheme(), "redis" | "rediss") || url.host_str().is_none_or(str::is_empty) {
        return None;
    }
    if url.port().is_none() {
        url.set_port(Some(DEFAULT_REDIS_PORT)).ok()?;
    }
    Some(url.into())
}

/// Redis store reachable over the network.
///
/// Values and the recency list live directly in the selected database, the
/// same layout every cooperating process uses. `size` is `DBSIZE` minus the
/// recency list; `flush_all` is `FLUSHDB`.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to the server at `url` (`redis://host:port/db`).
    ///
    /// The connection manager reconnects on its own after the first
    /// connection succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Redis`] if the URL is invalid or the server
    /// cannot be reached.
    #[instrument(skip_all)]
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("connected to redis DNS cache store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn list_push_front(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(list, value).await?;
        Ok(())
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(list, 0, value).await?;
        Ok(())
    }

    async fn list_pop_back(&self, list: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.rpop(list, None).await?;
        Ok(value)
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lrange(list, 0, -1).await?;
        Ok(values)
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let keys: usize = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        let lists: usize = conn.exists(LRU_LIST).await?;
        Ok(keys.saturating_sub(lists))
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let (): () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}
