//! Shardfetch Core Library
//!
//! Downloads shards of image URLs into samples: every row of a shard is
//! fetched under a retry budget, optionally gated by a DNS pre-flight
//! through a pool of public nameservers, verified, resized and handed to a
//! sample writer together with a fixed-shape metadata record.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - HTTP client, per-item retry and the shard engine
//! - [`dns`] - Nameserver pool resolution and the three cache backends
//! - [`db`] - SQLite connection and migrations for the persistent DNS store
//! - [`config`] - Downloader configuration and validation
//! - [`shard`], [`sample`], [`stats`] - Collaborator contracts around the engine
//! - [`key`], [`status`], [`hash`] - Sample keys, the capped status counter and digests

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod dns;
pub mod download;
pub mod hash;
pub mod key;
pub mod sample;
pub mod shard;
pub mod stats;
pub mod status;
pub mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, DownloaderConfig};
pub use db::DbError;
pub use dns::{
    CacheBackend, DomainResolver, PUBLIC_DNS_SERVERS, ResolverCache, ResolverCacheFactory,
    normalize_dns_error,
};
pub use download::{
    Collaborators, DownloadError, Downloader, EngineError, FetchOutcome, HttpClient, ShardError,
    fetch_with_retry,
};
pub use hash::HashAlgorithm;
pub use key::{compute_key, digits_for_capacity};
pub use sample::{SampleMeta, SampleStatus, SampleWriter, SampleWriterFactory};
pub use shard::{JsonLinesShardReader, ShardDescriptor, ShardReader};
pub use stats::{JsonStatsSink, ShardStats, StatsSink};
pub use status::{CappedCounter, CounterSnapshot};
