//! Per-shard statistics and the sink they are reported to.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use tracing::{debug, instrument};

use crate::status::CounterSnapshot;

/// Figures reported once per finished shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardStats {
    #[serde(skip)]
    pub output_folder: PathBuf,
    pub shard_id: u64,
    /// Digits the shard id is padded to in file names.
    #[serde(skip)]
    pub oom_shard_count: u32,
    pub count: u64,
    pub successes: u64,
    pub failed_to_download: u64,
    pub failed_to_resize: u64,
    /// Seconds since the Unix epoch.
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    #[serde(serialize_with = "serialize_counter")]
    pub status_dict: CounterSnapshot,
    pub dns_cache_hits: u64,
    pub dns_cache_misses: u64,
    pub dns_cache_size: u64,
    /// Highest number of samples admitted but not yet written.
    pub peak_in_flight: usize,
}

fn serialize_counter<S: Serializer>(snapshot: &CounterSnapshot, serializer: S) -> Result<S::Ok, S::Error> {
    snapshot.to_flat_map().serialize(serializer)
}

impl ShardStats {
    /// File name of the stats file, e.g. `00042_stats.json`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{:0width$}_stats.json",
            self.shard_id,
            width = self.oom_shard_count as usize
        )
    }
}

/// Receives shard statistics.
#[async_trait]
pub trait StatsSink: Send + Sync + std::fmt::Debug {
    async fn report(&self, stats: &ShardStats) -> std::io::Result<()>;
}

/// Writes `{output_folder}/{shard_id}_stats.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStatsSink;

#[async_trait]
impl StatsSink for JsonStatsSink {
    #[instrument(skip(self, stats), fields(shard_id = stats.shard_id))]
    async fn report(&self, stats: &ShardStats) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&stats.output_folder).await?;
        let path = stats.output_folder.join(stats.file_name());
        let body = serde_json::to_vec_pretty(stats)?;
        tokio::fs::write(&path, body).await?;
        debug!(path = %path.display(), "wrote shard stats");
        Ok(())
    }
}
