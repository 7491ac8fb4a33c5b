//! Resolver answer caches.
//!
//! Three interchangeable backends sit behind [`ResolverCache`]:
//!
//! | Backend | Scope | Eviction |
//! |---------|-------|----------|
//! | [`LocalCache`] | one worker | none; `dump()` drains |
//! | [`SharedCache`] | all workers of a process | none; first writer wins |
//! | [`RemoteLruCache`] | all cooperating processes | explicit `trim`/`flush` |
//!
//! The backend is picked by a [`CacheBackend`] tag validated at configuration
//! time.

mod local;
mod remote;
mod shared;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use hickory_proto::rr::{DNSClass, RecordType};
use serde::{Deserialize, Serialize};

pub use local::LocalCache;
pub use remote::{LRU_LIST, RemoteLruCache};
pub use shared::SharedCache;

use super::error::CacheError;
use crate::config::ConfigError;

/// Identity of one DNS question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Lowercase, fully-qualified name (trailing dot).
    pub name: String,
    /// Queried record type.
    pub record_type: RecordType,
    /// Queried record class.
    pub record_class: DNSClass,
}

impl CacheKey {
    /// Builds a key for an arbitrary question, normalizing the name.
    #[must_use]
    pub fn new(name: &str, record_type: RecordType, record_class: DNSClass) -> Self {
        let mut name = name.trim().to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        Self {
            name,
            record_type,
            record_class,
        }
    }

    /// Key for the `IN A` question the downloader asks for every host.
    #[must_use]
    pub fn address(name: &str) -> Self {
        Self::new(name, RecordType::A, DNSClass::IN)
    }

    /// Deterministic string form, `name:type:class` with numeric type/class.
    #[must_use]
    pub fn cache_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.name,
            u16::from(self.record_type),
            u16::from(self.record_class)
        )
    }
}

/// A resolved DNS result as stored in the caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    /// Name the answer is for.
    pub name: String,
    /// Addresses in answer order.
    pub addresses: Vec<IpAddr>,
    /// Smallest TTL among the address records.
    pub ttl: Option<u32>,
    /// Nameserver that produced the answer.
    pub nameserver: Option<IpAddr>,
}

impl Answer {
    /// First address of the answer, the one the downloader connects to.
    #[must_use]
    pub fn first_address(&self) -> Option<IpAddr> {
        self.addresses.first().copied()
    }
}

/// Hit/miss counters of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Cache backend tag, as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CacheBackend {
    /// One unshared map per worker.
    Local,
    /// One lock-guarded map per process.
    #[default]
    Shared,
    /// External store shared by many processes.
    Remote,
}

impl CacheBackend {
    /// Canonical configuration name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Shared => "shared",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CacheBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "individual_lru" => Ok(Self::Local),
            "shared" | "shared_lru" => Ok(Self::Shared),
            "remote" | "redis" => Ok(Self::Remote),
            _ => Err(ConfigError::InvalidCacheBackend(s.to_string())),
        }
    }
}

impl TryFrom<String> for CacheBackend {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CacheBackend> for String {
    fn from(value: CacheBackend) -> Self {
        value.name().to_string()
    }
}

/// One worker's handle on the configured answer cache.
#[derive(Debug)]
pub enum ResolverCache {
    Local(LocalCache),
    Shared(std::sync::Arc<SharedCache>),
    Remote(RemoteLruCache),
}

impl ResolverCache {
    /// Tag of the backend behind this handle.
    #[must_use]
    pub fn backend(&self) -> CacheBackend {
        match self {
            Self::Local(_) => CacheBackend::Local,
            Self::Shared(_) => CacheBackend::Shared,
            Self::Remote(_) => CacheBackend::Remote,
        }
    }

    /// Looks up an answer.
    ///
    /// # Errors
    ///
    /// Only the remote backend can fail (store or codec errors).
    pub async fn get(&mut self, key: &CacheKey) -> Result<Option<Answer>, CacheError> {
        match self {
            Self::Local(cache) => Ok(cache.get(key)),
            Self::Shared(cache) => Ok(cache.get(key)),
            Self::Remote(cache) => cache.get(key).await,
        }
    }

    /// Stores an answer.
    ///
    /// The shared backend keeps an existing answer for `key` instead of
    /// overwriting it.
    ///
    /// # Errors
    ///
    /// Only the remote backend can fail (store or codec errors).
    pub async fn put(&mut self, key: CacheKey, answer: Answer) -> Result<(), CacheError> {
        match self {
            Self::Local(cache) => {
                cache.put(key, answer);
                Ok(())
            }
            Self::Shared(cache) => {
                cache.put(key, answer);
                Ok(())
            }
            Self::Remote(cache) => cache.put(&key, &answer).await,
        }
    }

    /// Number of cached entries visible through this handle.
    ///
    /// # Errors
    ///
    /// Only the remote backend can fail.
    pub async fn len(&self) -> Result<usize, CacheError> {
        match self {
            Self::Local(cache) => Ok(cache.len()),
            Self::Shared(cache) => Ok(cache.len()),
            Self::Remote(cache) => cache.len().await,
        }
    }

    /// Backend counters. For the shared backend these are process-wide.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        match self {
            Self::Local(cache) => cache.stats(),
            Self::Shared(cache) => cache.stats(),
            Self::Remote(cache) => cache.stats(),
        }
    }
}
