//! DNS resolution through public nameservers, with pluggable answer caches.
//!
//! Each download worker owns a [`DomainResolver`] handed out by a
//! process-wide [`ResolverCacheFactory`]. Resolution checks the worker's
//! [`ResolverCache`] first, then queries randomly chosen members of
//! [`PUBLIC_DNS_SERVERS`], blacklisting each one that fails for the rest of
//! that call.

pub mod cache;
pub mod client;
pub mod error;
mod factory;
mod resolver;
pub mod store;

pub use cache::{
    Answer, CacheBackend, CacheKey, CacheStats, LocalCache, RemoteLruCache, ResolverCache,
    SharedCache,
};
pub use client::{NameserverClient, UdpNameserverClient};
pub use error::{CacheError, DnsError, StoreError, normalize_dns_error};
pub use factory::ResolverCacheFactory;
pub use resolver::{DomainResolver, PUBLIC_DNS_SERVERS, ResolveFailure};
pub use store::{DEFAULT_REDIS_PORT, MemoryStore, RedisStore, RemoteStore, SqliteStore, redis_url};
