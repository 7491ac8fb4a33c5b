//! Host resolution against a rotating pool of public nameservers.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::cache::{CacheKey, ResolverCache};
use super::client::NameserverClient;
use super::error::{ALL_NAMESERVERS_FAILED, DnsError, normalize_dns_error};

/// Public resolvers queried when public DNS is enabled.
pub const PUBLIC_DNS_SERVERS: [IpAddr; 7] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
    IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
    IpAddr::V4(Ipv4Addr::new(208, 67, 222, 222)),
    IpAddr::V4(Ipv4Addr::new(208, 67, 220, 220)),
];

/// A resolution that exhausted its retry budget.
///
/// `message` is already normalized by [`normalize_dns_error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ResolveFailure {
    pub message: String,
    /// Nameservers tried, in order.
    pub attempted: Vec<IpAddr>,
}

/// Per-worker resolver: a cache handle plus the nameserver pool.
#[derive(Debug)]
pub struct DomainResolver {
    cache: ResolverCache,
    client: Arc<dyn NameserverClient>,
    nameservers: Arc<[IpAddr]>,
    hits: u64,
    misses: u64,
}

impl DomainResolver {
    /// Resolver over [`PUBLIC_DNS_SERVERS`].
    #[must_use]
    pub fn new(cache: ResolverCache, client: Arc<dyn NameserverClient>) -> Self {
        Self::with_nameservers(cache, client, PUBLIC_DNS_SERVERS.into())
    }

    #[must_use]
    pub fn with_nameservers(
        cache: ResolverCache,
        client: Arc<dyn NameserverClient>,
        nameservers: Arc<[IpAddr]>,
    ) -> Self {
        Self {
            cache,
            client,
            nameservers,
            hits: 0,
            misses: 0,
        }
    }

    /// Resolves `domain` with a fresh blacklist.
    ///
    /// Failures only blacklist a nameserver for this one call; the next call
    /// starts with the whole pool again.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveFailure`] once `max_retries + 1` nameservers failed.
    pub async fn resolve(&mut self, domain: &str, max_retries: u32) -> Result<IpAddr, ResolveFailure> {
        let mut blacklist = HashSet::new();
        self.resolve_domain(domain, &mut blacklist, max_retries).await
    }

    /// Resolves `domain` to its first address.
    ///
    /// The cache is consulted first. On a miss, up to `max_retries + 1`
    /// nameservers are drawn uniformly at random from the pool, skipping
    /// those in `blacklist`; each one that fails is added to it. The loop
    /// stops early when every pool member is blacklisted.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveFailure`] carrying the normalized text of the last
    /// nameserver error.
    #[instrument(level = "debug", skip(self, blacklist))]
    pub async fn resolve_domain(
        &mut self,
        domain: &str,
        blacklist: &mut HashSet<IpAddr>,
        max_retries: u32,
    ) -> Result<IpAddr, ResolveFailure> {
        let key = CacheKey::address(domain);

        match self.cache.get(&key).await {
            Ok(Some(answer)) => {
                if let Some(ip) = answer.first_address() {
                    self.hits += 1;
                    debug!(domain, %ip, "DNS cache hit");
                    return Ok(ip);
                }
                self.misses += 1;
            }
            Ok(None) => self.misses += 1,
            Err(error) => {
                self.misses += 1;
                warn!(domain, error = %error, "DNS cache lookup failed");
            }
        }

        let mut attempted = Vec::new();
        let mut last_error: Option<DnsError> = None;

        for _ in 0..=max_retries {
            let candidates: Vec<IpAddr> = self
                .nameservers
                .iter()
                .copied()
                .filter(|ns| !blacklist.contains(ns))
                .collect();
            let Some(&nameserver) = candidates.choose(&mut rand::thread_rng()) else {
                break;
            };
            attempted.push(nameserver);

            match self.client.query(nameserver, &key).await {
                Ok(answer) => {
                    if let Some(ip) = answer.first_address() {
                        if let Err(error) = self.cache.put(key, answer).await {
                            warn!(domain, error = %error, "failed to cache DNS answer");
                        }
                        return Ok(ip);
                    }
                    last_error = Some(DnsError::NoAnswer {
                        name: key.name.clone(),
                    });
                }
                Err(error) => {
                    debug!(domain, %nameserver, error = %error, "nameserver failed");
                    last_error = Some(error);
                }
            }
            blacklist.insert(nameserver);
        }

        let message = last_error.map_or_else(
            || ALL_NAMESERVERS_FAILED.to_string(),
            |error| normalize_dns_error(&error.to_string()),
        );
        Err(ResolveFailure { message, attempted })
    }

    /// Cache hits seen by this resolver.
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.hits
    }

    /// Cache misses seen by this resolver.
    #[must_use]
    pub fn cache_misses(&self) -> u64 {
        self.misses
    }

    #[must_use]
    pub fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    /// Gives the cache handle back, e.g. to drain a local cache.
    #[must_use]
    pub fn into_cache(self) -> ResolverCache {
        self.cache
    }
}
