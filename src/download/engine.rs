//! Shard download engine.
//!
//! [`Downloader`] turns one shard of URL rows into one sample per row. A
//! shard is read in full, its rows are pushed through a bounded
//! producer/worker pipeline, every row ends in exactly one
//! [`SampleWriter::write`](crate::sample::SampleWriter::write) call, and the
//! shard's statistics are reported once the writer is closed.
//!
//! # Example
//!
//! ```no_run
//! use shardfetch::download::{Collaborators, Downloader};
//! use shardfetch::{DownloaderConfig, ShardDescriptor};
//!
//! # async fn example(collaborators: Collaborators) -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = Downloader::new(DownloaderConfig::default(), collaborators, None)?;
//! let (ok, shard) = downloader.run(ShardDescriptor::new(0, "shards/00000.jsonl")).await;
//! println!("shard {} finished: {ok}", shard.shard_id);
//! # Ok(())
//! # }
//! ```

mod pipeline;

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use tokio::task::JoinError;
use tracing::{error, info, instrument, warn};

use self::pipeline::{ColumnLayout, ShardContext, Tallies};
use super::HttpClient;
use crate::config::{ConfigError, DownloaderConfig};
use crate::dns::ResolverCacheFactory;
use crate::key::digits_for_capacity;
use crate::sample::{ExifReader, FieldKind, Resizer, SampleWriterFactory, Schema, WriterSpec};
use crate::shard::{ShardDescriptor, ShardReadError, ShardReader};
use crate::stats::{ShardStats, StatsSink};
use crate::status::CappedCounter;

/// Construction-time failures of a [`Downloader`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// `use_public_dns` is set but no resolver factory was supplied.
    #[error("use_public_dns requires a resolver cache factory")]
    ResolverFactoryMissing,
}

/// Failures that abort a whole shard.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("failed to read shard: {0}")]
    Read(#[from] ShardReadError),

    #[error("failed to open sample writer: {0}")]
    WriterOpen(#[source] io::Error),

    #[error("failed to close sample writer: {0}")]
    WriterClose(#[source] io::Error),

    #[error("failed to report shard statistics: {0}")]
    Stats(#[source] io::Error),

    /// A producer or worker task died outside the per-item guard.
    #[error("pipeline task failed: {0}")]
    Worker(#[source] JoinError),
}

/// The pluggable parts of a shard run.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub reader: Arc<dyn ShardReader>,
    pub writer_factory: Arc<dyn SampleWriterFactory>,
    pub resizer: Arc<dyn Resizer>,
    /// Only consulted when `extract_exif` is set.
    pub exif: Option<Arc<dyn ExifReader>>,
    pub stats: Arc<dyn StatsSink>,
}

impl Collaborators {
    #[must_use]
    pub fn new(
        reader: Arc<dyn ShardReader>,
        writer_factory: Arc<dyn SampleWriterFactory>,
        resizer: Arc<dyn Resizer>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            reader,
            writer_factory,
            resizer,
            exif: None,
            stats,
        }
    }

    #[must_use]
    pub fn with_exif(mut self, exif: Arc<dyn ExifReader>) -> Self {
        self.exif = Some(exif);
        self
    }
}

/// Downloads shards. One instance serves any number of shards, sequentially
/// or concurrently.
#[derive(Debug)]
pub struct Downloader {
    config: Arc<DownloaderConfig>,
    layout: ColumnLayout,
    collaborators: Collaborators,
    client: Arc<HttpClient>,
    dns: Option<Arc<ResolverCacheFactory>>,
    digits_per_shard: u32,
}

impl Downloader {
    /// Normalizes and validates `config` and builds the shared HTTP client.
    ///
    /// `dns` is required when `use_public_dns` is set and ignored otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for an invalid config,
    /// [`EngineError::ResolverFactoryMissing`] when DNS pre-flight is enabled
    /// without a factory, and [`EngineError::HttpClient`] if the client
    /// cannot be built.
    #[instrument(level = "debug", skip_all)]
    pub fn new(
        config: DownloaderConfig,
        collaborators: Collaborators,
        dns: Option<Arc<ResolverCacheFactory>>,
    ) -> Result<Self, EngineError> {
        let config = config.normalized();
        config.validate()?;

        let dns = if config.use_public_dns {
            let factory = dns.ok_or(EngineError::ResolverFactoryMissing)?;
            if factory.backend() != config.dns_cache_type {
                warn!(
                    configured = %config.dns_cache_type,
                    factory = %factory.backend(),
                    "resolver factory backend differs from config, using the factory's"
                );
            }
            Some(factory)
        } else {
            None
        };

        let client = HttpClient::new(
            Duration::from_secs(config.timeout_secs),
            config.user_agent_token.clone(),
            config.disallowed_header_directives.clone(),
        )
        .map_err(EngineError::HttpClient)?;

        info!(
            thread_count = config.thread_count,
            retries = config.retries,
            use_public_dns = config.use_public_dns,
            "creating shard downloader"
        );

        Ok(Self {
            layout: ColumnLayout::new(&config)?,
            digits_per_shard: digits_for_capacity(config.number_sample_per_shard),
            config: Arc::new(config),
            collaborators,
            client: Arc::new(client),
            dns,
        })
    }

    #[must_use]
    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Runs one shard and never fails: errors and panics are logged and
    /// reported as `false`. The descriptor is handed back for retry
    /// bookkeeping.
    pub async fn run(&self, shard: ShardDescriptor) -> (bool, ShardDescriptor) {
        let outcome = AssertUnwindSafe(self.download_shard(&shard)).catch_unwind().await;
        match outcome {
            Ok(Ok(_)) => (true, shard),
            Ok(Err(err)) => {
                error!(shard_id = shard.shard_id, error = %err, "shard failed");
                (false, shard)
            }
            Err(panic) => {
                error!(
                    shard_id = shard.shard_id,
                    panic = %pipeline::panic_message(panic.as_ref()),
                    "shard panicked"
                );
                (false, shard)
            }
        }
    }

    /// Downloads every row of `shard` and reports its statistics.
    ///
    /// On success the shard input has been removed through the reader.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError`] when the shard cannot be read, the writer
    /// cannot be opened or closed, the statistics cannot be reported, or a
    /// pipeline task dies. Individual item failures are recorded as samples
    /// and never surface here.
    #[instrument(skip(self), fields(shard_id = shard.shard_id))]
    pub async fn download_shard(&self, shard: &ShardDescriptor) -> Result<ShardStats, ShardError> {
        let start_time = unix_now();
        let started = Instant::now();

        let batch = self.collaborators.reader.read(&shard.locator).await?;
        let schema = self.output_schema(&batch.columns);
        let rows = batch.project(&self.config.column_list)?;
        drop(batch);
        let count = rows.len() as u64;
        info!(count, "starting shard");

        let writer = self
            .collaborators
            .writer_factory
            .create(WriterSpec {
                shard_id: shard.shard_id,
                output_folder: self.config.output_folder.clone(),
                save_caption: self.config.save_caption,
                oom_shard_count: self.config.oom_shard_count,
                schema: schema.clone(),
                encode_format: self.config.encode_format.clone(),
            })
            .await
            .map_err(ShardError::WriterOpen)?;

        let ctx = Arc::new(ShardContext {
            shard_id: shard.shard_id,
            config: Arc::clone(&self.config),
            layout: self.layout.clone(),
            schema,
            digits_per_shard: self.digits_per_shard,
            writer: Arc::clone(&writer),
            resizer: Arc::clone(&self.collaborators.resizer),
            exif: self.collaborators.exif.clone(),
            counter: CappedCounter::new(self.config.status_counter_capacity),
            tallies: Tallies::default(),
        });

        let report = pipeline::run(Arc::clone(&ctx), rows, &self.client, self.dns.as_ref()).await?;

        writer.close().await.map_err(ShardError::WriterClose)?;

        let dns_cache_size = match &self.dns {
            Some(factory) => factory.cache_size().await as u64,
            None => 0,
        };
        let end_time = unix_now();
        let stats = ShardStats {
            output_folder: self.config.output_folder.clone(),
            shard_id: shard.shard_id,
            oom_shard_count: self.config.oom_shard_count,
            count,
            successes: ctx.tallies.successes.load(std::sync::atomic::Ordering::SeqCst),
            failed_to_download: ctx
                .tallies
                .failed_to_download
                .load(std::sync::atomic::Ordering::SeqCst),
            failed_to_resize: ctx
                .tallies
                .failed_to_resize
                .load(std::sync::atomic::Ordering::SeqCst),
            start_time,
            end_time,
            duration: started.elapsed().as_secs_f64(),
            status_dict: ctx.counter.snapshot(),
            dns_cache_hits: report.dns_cache_hits,
            dns_cache_misses: report.dns_cache_misses,
            dns_cache_size,
            peak_in_flight: report.peak_in_flight,
        };

        self.collaborators
            .stats
            .report(&stats)
            .await
            .map_err(ShardError::Stats)?;
        self.collaborators.reader.remove(&shard.locator).await?;

        info!(
            count,
            successes = stats.successes,
            failed_to_download = stats.failed_to_download,
            failed_to_resize = stats.failed_to_resize,
            duration = stats.duration,
            "shard finished"
        );
        Ok(stats)
    }

    /// Input columns, then the fixed sample fields, then the optional exif
    /// and hash columns.
    fn output_schema(&self, columns: &[String]) -> Schema {
        let mut schema = Schema::from_columns(columns)
            .append("key", FieldKind::String)
            .append("status", FieldKind::String)
            .append("error_message", FieldKind::String)
            .append("width", FieldKind::Int32)
            .append("height", FieldKind::Int32)
            .append("original_width", FieldKind::Int32)
            .append("original_height", FieldKind::Int32);
        if self.config.extract_exif {
            schema = schema.append("exif", FieldKind::String);
        }
        if let Some(algorithm) = self.config.compute_hash
            && !schema.contains(algorithm.name())
        {
            schema = schema.append(algorithm.name(), FieldKind::String);
        }
        schema
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}
