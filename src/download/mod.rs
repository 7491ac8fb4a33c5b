//! Image download: HTTP fetches, retries and the shard engine.
//!
//! [`HttpClient`] fetches single payloads, [`fetch_with_retry`] wraps one
//! item in its retry budget, and [`Downloader`] runs whole shards through
//! a bounded worker pipeline.
//!
//! # Example
//!
//! ```no_run
//! use shardfetch::download::{HttpClient, ItemFetcher, fetch_with_retry};
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(HttpClient::new(Duration::from_secs(10), None, BTreeSet::new())?);
//! let mut fetcher = ItemFetcher::new(client, None, 0);
//! let outcome = fetch_with_retry(&mut fetcher, 0, "https://example.com/cat.jpg", 2).await;
//! println!("{} attempts, error: {:?}", outcome.attempts, outcome.error);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod engine;
mod error;
pub mod robots;
mod retry;

pub use client::HttpClient;
pub use engine::{Collaborators, Downloader, EngineError, ShardError};
pub use error::{DISALLOWED_MESSAGE, DownloadError, HASH_MISMATCH_MESSAGE};
pub use retry::{FetchAttempt, FetchOutcome, ItemFetcher, fetch_with_retry};
