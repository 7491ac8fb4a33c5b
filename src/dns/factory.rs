//! Process-wide source of resolver caches.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::cache::{CacheBackend, LocalCache, RemoteLruCache, ResolverCache, SharedCache};
use super::client::{NameserverClient, UdpNameserverClient};
use super::resolver::{DomainResolver, PUBLIC_DNS_SERVERS};
use super::store::{RedisStore, RemoteStore, SqliteStore, redis_url};
use crate::config::{ConfigError, DownloaderConfig};

/// Built once per process and passed to every worker.
///
/// Holds the validated backend tag, the remote store handle (remote backend
/// only) and the process-wide [`SharedCache`]. The shared cache serves the
/// shared backend directly and aggregates local caches: each local cache
/// starts empty and is drained into it with [`Self::reclaim`].
#[derive(Debug)]
pub struct ResolverCacheFactory {
    backend: CacheBackend,
    shared: Arc<SharedCache>,
    store: Option<Arc<dyn RemoteStore>>,
    client: Arc<dyn NameserverClient>,
    nameservers: Arc<[IpAddr]>,
}

impl ResolverCacheFactory {
    /// Creates a factory querying [`PUBLIC_DNS_SERVERS`] over UDP.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RemoteStoreMissing`] for the remote backend
    /// without a store.
    pub fn new(
        backend: CacheBackend,
        store: Option<Arc<dyn RemoteStore>>,
    ) -> Result<Self, ConfigError> {
        if backend == CacheBackend::Remote && store.is_none() {
            return Err(ConfigError::RemoteStoreMissing);
        }
        Ok(Self {
            backend,
            shared: Arc::new(SharedCache::new()),
            store,
            client: Arc::new(UdpNameserverClient::default()),
            nameservers: PUBLIC_DNS_SERVERS.into(),
        })
    }

    /// Builds the factory described by `config`.
    ///
    /// The remote backend connects to `dns_cache_host` (Redis) when set,
    /// otherwise opens the SQLite file at `dns_cache_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if no remote store is configured, the host is
    /// not a Redis address, or the store cannot be reached.
    pub async fn from_config(config: &DownloaderConfig) -> Result<Self, ConfigError> {
        let store = match config.dns_cache_type {
            CacheBackend::Remote => Some(open_remote_store(config).await?),
            CacheBackend::Local | CacheBackend::Shared => None,
        };
        let client = UdpNameserverClient::new(Duration::from_millis(config.dns_timeout_ms));
        Ok(Self::new(config.dns_cache_type, store)?.with_client(Arc::new(client)))
    }

    /// Replaces the nameserver client.
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn NameserverClient>) -> Self {
        self.client = client;
        self
    }

    /// Replaces the nameserver pool.
    #[must_use]
    pub fn with_nameservers(mut self, nameservers: impl Into<Arc<[IpAddr]>>) -> Self {
        self.nameservers = nameservers.into();
        self
    }

    #[must_use]
    pub fn backend(&self) -> CacheBackend {
        self.backend
    }

    /// The process-wide merge cache.
    #[must_use]
    pub fn shared(&self) -> &Arc<SharedCache> {
        &self.shared
    }

    /// A fresh cache handle for one worker.
    #[must_use]
    pub fn create_cache(&self) -> ResolverCache {
        match (self.backend, &self.store) {
            (CacheBackend::Remote, Some(store)) => {
                ResolverCache::Remote(RemoteLruCache::new(Arc::clone(store)))
            }
            (CacheBackend::Local, _) => ResolverCache::Local(LocalCache::new()),
            _ => ResolverCache::Shared(Arc::clone(&self.shared)),
        }
    }

    /// A resolver for one worker, over a fresh cache handle.
    #[must_use]
    pub fn resolver(&self) -> DomainResolver {
        DomainResolver::with_nameservers(
            self.create_cache(),
            Arc::clone(&self.client),
            Arc::clone(&self.nameservers),
        )
    }

    /// Takes a worker's resolver back. Local cache entries are merged into
    /// the shared aggregator; returns how many were new.
    pub fn reclaim(&self, resolver: DomainResolver) -> usize {
        match resolver.into_cache() {
            ResolverCache::Local(mut cache) => {
                let added = self.shared.merge(cache.dump());
                debug!(added, "merged local DNS cache into aggregator");
                added
            }
            ResolverCache::Shared(_) | ResolverCache::Remote(_) => 0,
        }
    }

    /// Entries currently cached for this backend. Store failures are logged
    /// and reported as zero.
    pub async fn cache_size(&self) -> usize {
        match (self.backend, &self.store) {
            (CacheBackend::Remote, Some(store)) => match store.size().await {
                Ok(size) => size,
                Err(error) => {
                    warn!(error = %error, "failed to read remote DNS cache size");
                    0
                }
            },
            _ => self.shared.len(),
        }
    }
}

async fn open_remote_store(config: &DownloaderConfig) -> Result<Arc<dyn RemoteStore>, ConfigError> {
    if let Some(host) = config.dns_cache_host.as_deref() {
        let url = redis_url(host).ok_or_else(|| ConfigError::InvalidCacheHost(host.to_string()))?;
        info!(host, "connecting to remote DNS cache store");
        return Ok(Arc::new(RedisStore::connect(&url).await?));
    }
    let path = config
        .dns_cache_path
        .as_deref()
        .ok_or(ConfigError::RemoteStoreMissing)?;
    info!(path = %path.display(), "opening remote DNS cache store");
    Ok(Arc::new(SqliteStore::open(path).await?))
}
