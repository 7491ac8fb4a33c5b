//! Per-item fetch attempts and the retry loop around them.
//!
//! There is no backoff and no failure classification: an item gets
//! `retries + 1` immediate attempts, the first payload wins and otherwise
//! the last attempt's error is kept.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument};
use url::Host;

use super::{DownloadError, HttpClient};
use crate::dns::DomainResolver;

/// Result of fetching one item, after all retries.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    /// Ordinal of the item in its shard.
    pub key: u64,
    pub payload: Option<Bytes>,
    /// Error of the last attempt, when no attempt produced a payload.
    pub error: Option<String>,
    /// Attempts made.
    pub attempts: u32,
}

/// One fetch attempt for a URL.
#[async_trait]
pub trait FetchAttempt: Send {
    async fn attempt(&mut self, url: &str) -> Result<Bytes, DownloadError>;
}

/// Production attempt: optional DNS pre-flight, then an HTTP GET.
///
/// The resolution only gates the request; the GET still goes to the
/// original URL so TLS and virtual hosting keep working. Hosts given as
/// address literals skip the lookup.
#[derive(Debug)]
pub struct ItemFetcher {
    client: Arc<HttpClient>,
    resolver: Option<DomainResolver>,
    dns_retries: u32,
}

impl ItemFetcher {
    #[must_use]
    pub fn new(client: Arc<HttpClient>, resolver: Option<DomainResolver>, dns_retries: u32) -> Self {
        Self {
            client,
            resolver,
            dns_retries,
        }
    }

    #[must_use]
    pub fn resolver(&self) -> Option<&DomainResolver> {
        self.resolver.as_ref()
    }

    /// Gives the resolver back once the worker is done.
    #[must_use]
    pub fn into_resolver(self) -> Option<DomainResolver> {
        self.resolver
    }
}

#[async_trait]
impl FetchAttempt for ItemFetcher {
    async fn attempt(&mut self, url: &str) -> Result<Bytes, DownloadError> {
        if let Some(resolver) = self.resolver.as_mut() {
            let parsed =
                url::Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))?;
            match parsed.host() {
                Some(Host::Domain(domain)) => {
                    if let Err(failure) = resolver.resolve(domain, self.dns_retries).await {
                        return Err(DownloadError::DnsResolution {
                            domain: domain.to_string(),
                            reason: failure.message,
                        });
                    }
                }
                // address literals need no lookup
                Some(Host::Ipv4(_) | Host::Ipv6(_)) => {}
                None => return Err(DownloadError::invalid_url(url, "URL has no host")),
            }
        }
        self.client.fetch(url).await
    }
}

/// Fetches `url` with up to `retries + 1` attempts.
#[instrument(level = "debug", skip(fetcher))]
pub async fn fetch_with_retry<F>(fetcher: &mut F, key: u64, url: &str, retries: u32) -> FetchOutcome
where
    F: FetchAttempt + ?Sized,
{
    let mut last_error = None;
    let mut attempts = 0;
    for _ in 0..=retries {
        attempts += 1;
        match fetcher.attempt(url).await {
            Ok(payload) => {
                return FetchOutcome {
                    key,
                    payload: Some(payload),
                    error: None,
                    attempts,
                };
            }
            Err(error) => {
                debug!(attempt = attempts, error = %error, "fetch attempt failed");
                last_error = Some(error.to_string());
            }
        }
    }
    FetchOutcome {
        key,
        payload: None,
        error: last_error,
        attempts,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Fails with a numbered timeout-like error until `succeed_on`.
    struct Scripted {
        calls: u32,
        succeed_on: Option<u32>,
    }

    #[async_trait]
    impl FetchAttempt for Scripted {
        async fn attempt(&mut self, url: &str) -> Result<Bytes, DownloadError> {
            self.calls += 1;
            if Some(self.calls) == self.succeed_on {
                return Ok(Bytes::from_static(b"img"));
            }
            Err(DownloadError::invalid_url(url, format!("attempt {}", self.calls)))
        }
    }

    #[tokio::test]
    async fn test_first_payload_short_circuits() {
        let mut fetcher = Scripted {
            calls: 0,
            succeed_on: Some(2),
        };
        let outcome = fetch_with_retry(&mut fetcher, 7, "https://a.example/x.jpg", 5).await;

        assert_eq!(outcome.key, 7);
        assert_eq!(outcome.payload, Some(Bytes::from_static(b"img")));
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(fetcher.calls, 2);
    }

    #[tokio::test]
    async fn test_exhausted_budget_keeps_last_error() {
        let mut fetcher = Scripted {
            calls: 0,
            succeed_on: None,
        };
        let outcome = fetch_with_retry(&mut fetcher, 0, "https://a.example/x.jpg", 2).await;

        assert!(outcome.payload.is_none());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.error.as_deref(), Some("invalid URL: attempt 3"));
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let mut fetcher = Scripted {
            calls: 0,
            succeed_on: None,
        };
        let outcome = fetch_with_retry(&mut fetcher, 0, "u", 0).await;
        assert_eq!(outcome.attempts, 1);
    }
}
