//! Constants for the download module.

/// Rows admitted into a shard pipeline per worker: the semaphore holds
/// `BACKPRESSURE_FACTOR * thread_count` permits.
pub const BACKPRESSURE_FACTOR: usize = 2;
