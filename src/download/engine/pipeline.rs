//! Producer/worker pipeline for the rows of one shard.
//!
//! The producer takes a semaphore permit before handing a row to the
//! bounded channel; workers release it once the row's sample is written.
//! At most `BACKPRESSURE_FACTOR * thread_count` rows are therefore queued
//! or being processed at any time.

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinError;
use tracing::{debug, warn};

use super::ShardError;
use crate::config::{ConfigError, DownloaderConfig};
use crate::dns::ResolverCacheFactory;
use crate::download::constants::BACKPRESSURE_FACTOR;
use crate::download::{HASH_MISMATCH_MESSAGE, HttpClient, ItemFetcher, fetch_with_retry};
use crate::hash::HashAlgorithm;
use crate::key::compute_key;
use crate::sample::{ExifReader, Resizer, SampleMeta, SampleStatus, SampleWriter, Schema};
use crate::shard::ShardRow;
use crate::status::CappedCounter;

/// Positions of the columns the pipeline reads, within `column_list`.
#[derive(Debug, Clone)]
pub(super) struct ColumnLayout {
    names: Vec<String>,
    url: usize,
    caption: Option<usize>,
    verify: Option<(HashAlgorithm, usize)>,
    bbox: Option<usize>,
}

impl ColumnLayout {
    /// `config` must already be validated; a missing url column yields
    /// [`ConfigError::MissingUrlColumn`].
    pub(super) fn new(config: &DownloaderConfig) -> Result<Self, ConfigError> {
        let position = |name: &str| config.column_list.iter().position(|column| column == name);
        let url = position("url").ok_or(ConfigError::MissingUrlColumn)?;
        let caption = if config.save_caption { position("caption") } else { None };
        let verify = config
            .verify_hash_type
            .and_then(|algorithm| position(algorithm.name()).map(|index| (algorithm, index)));
        let bbox = config.blurring_bbox_col.as_deref().and_then(position);
        Ok(Self {
            names: config.column_list.clone(),
            url,
            caption,
            verify,
            bbox,
        })
    }

    /// Input columns carried into the sample metadata. The verification
    /// column is left out.
    fn meta_columns(&self, row: &ShardRow) -> Vec<(String, Value)> {
        let skip = self.verify.map(|(_, index)| index);
        self.names
            .iter()
            .zip(&row.values)
            .enumerate()
            .filter(|(index, _)| Some(*index) != skip)
            .map(|(_, (name, value))| (name.clone(), value.clone()))
            .collect()
    }
}

/// Per-status counts of one shard.
#[derive(Debug, Default)]
pub(super) struct Tallies {
    pub(super) successes: AtomicU64,
    pub(super) failed_to_download: AtomicU64,
    pub(super) failed_to_resize: AtomicU64,
}

/// Everything a worker needs besides its own fetcher.
#[derive(Debug)]
pub(super) struct ShardContext {
    pub(super) shard_id: u64,
    pub(super) config: Arc<DownloaderConfig>,
    pub(super) layout: ColumnLayout,
    pub(super) schema: Schema,
    pub(super) digits_per_shard: u32,
    pub(super) writer: Arc<dyn SampleWriter>,
    pub(super) resizer: Arc<dyn Resizer>,
    pub(super) exif: Option<Arc<dyn ExifReader>>,
    pub(super) counter: CappedCounter,
    pub(super) tallies: Tallies,
}

/// What the pipeline hands back once every row is processed.
#[derive(Debug, Default)]
pub(super) struct PipelineReport {
    pub(super) dns_cache_hits: u64,
    pub(super) dns_cache_misses: u64,
    pub(super) peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// A semaphore permit that also counts towards the in-flight gauge.
struct InFlightPermit {
    _permit: OwnedSemaphorePermit,
    gauge: Arc<InFlight>,
}

impl InFlightPermit {
    fn new(permit: OwnedSemaphorePermit, gauge: Arc<InFlight>) -> Self {
        let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);
        Self {
            _permit: permit,
            gauge,
        }
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

type RowReceiver = Arc<Mutex<mpsc::Receiver<(ShardRow, InFlightPermit)>>>;

/// Item-level faults. Logged; the item gets no sample.
#[derive(Debug, Error)]
enum ItemError {
    #[error("sample writer failed: {0}")]
    Write(#[source] io::Error),

    #[error("resize task failed: {0}")]
    Resize(#[source] JoinError),
}

/// Runs every row through `thread_count` workers.
///
/// # Errors
///
/// Returns [`ShardError::Worker`] if the producer or a worker task dies.
/// Item-level failures never end the shard.
pub(super) async fn run(
    ctx: Arc<ShardContext>,
    rows: Vec<ShardRow>,
    client: &Arc<HttpClient>,
    dns: Option<&Arc<ResolverCacheFactory>>,
) -> Result<PipelineReport, ShardError> {
    let workers = ctx.config.thread_count;
    let semaphore = Arc::new(Semaphore::new(workers * BACKPRESSURE_FACTOR));
    let gauge = Arc::new(InFlight::default());
    let (tx, rx) = mpsc::channel(workers);
    let rx: RowReceiver = Arc::new(Mutex::new(rx));

    let producer = tokio::spawn(produce(rows, semaphore, Arc::clone(&gauge), tx));

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let fetcher = ItemFetcher::new(
            Arc::clone(client),
            dns.map(|factory| factory.resolver()),
            ctx.config.dns_num_retries,
        );
        handles.push(tokio::spawn(work(
            worker_id,
            Arc::clone(&ctx),
            Arc::clone(&rx),
            fetcher,
        )));
    }

    producer.await.map_err(ShardError::Worker)?;

    let mut report = PipelineReport::default();
    for handle in handles {
        let fetcher = handle.await.map_err(ShardError::Worker)?;
        if let Some(resolver) = fetcher.into_resolver() {
            report.dns_cache_hits += resolver.cache_hits();
            report.dns_cache_misses += resolver.cache_misses();
            if let Some(factory) = dns {
                factory.reclaim(resolver);
            }
        }
    }
    report.peak_in_flight = gauge.peak.load(Ordering::SeqCst);
    Ok(report)
}

async fn produce(
    rows: Vec<ShardRow>,
    semaphore: Arc<Semaphore>,
    gauge: Arc<InFlight>,
    tx: mpsc::Sender<(ShardRow, InFlightPermit)>,
) {
    for row in rows {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            warn!("semaphore closed, stopping producer");
            break;
        };
        let permit = InFlightPermit::new(permit, Arc::clone(&gauge));
        if tx.send((row, permit)).await.is_err() {
            warn!("all workers exited, stopping producer");
            break;
        }
    }
}

/// Drains the channel. Returns the fetcher so its resolver can be reclaimed.
async fn work(worker_id: usize, ctx: Arc<ShardContext>, rx: RowReceiver, mut fetcher: ItemFetcher) -> ItemFetcher {
    let mut processed = 0_u64;
    loop {
        let next = rx.lock().await.recv().await;
        let Some((row, permit)) = next else { break };
        let key = row.key;
        match AssertUnwindSafe(process_item(&ctx, &mut fetcher, row))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(shard_id = ctx.shard_id, key, error = %error, "sample dropped");
            }
            Err(panic) => {
                warn!(
                    shard_id = ctx.shard_id,
                    key,
                    panic = %panic_message(panic.as_ref()),
                    "sample processing panicked"
                );
            }
        }
        drop(permit);
        processed += 1;
    }
    debug!(shard_id = ctx.shard_id, worker_id, processed, "worker finished");
    fetcher
}

async fn process_item(ctx: &ShardContext, fetcher: &mut ItemFetcher, row: ShardRow) -> Result<(), ItemError> {
    let url = row.values[ctx.layout.url].as_str().unwrap_or_default();
    let outcome = fetch_with_retry(fetcher, row.key, url, ctx.config.retries).await;

    let str_key = compute_key(
        row.key,
        ctx.shard_id,
        ctx.digits_per_shard,
        ctx.config.oom_shard_count,
    );
    let caption = ctx.layout.caption.and_then(|index| row.values[index].as_str());
    let columns = ctx.layout.meta_columns(&row);

    let Some(payload) = outcome.payload else {
        let message = outcome.error.unwrap_or_else(|| "unknown error".to_string());
        return write_failure(ctx, str_key, columns, caption, SampleStatus::FailedToDownload, message).await;
    };

    if let Some((algorithm, index)) = ctx.layout.verify {
        let digest = algorithm.hex_digest(&payload);
        if row.values[index].as_str() != Some(digest.as_str()) {
            return write_failure(
                ctx,
                str_key,
                columns,
                caption,
                SampleStatus::FailedToDownload,
                HASH_MISMATCH_MESSAGE.to_string(),
            )
            .await;
        }
    }

    let resizer = Arc::clone(&ctx.resizer);
    let exif_reader = ctx.exif.as_ref().filter(|_| ctx.config.extract_exif).map(Arc::clone);
    let bbox = ctx.layout.bbox.map(|index| row.values[index].clone());
    let input = payload.clone();
    let (resized, exif) = tokio::task::spawn_blocking(move || {
        let resized = resizer.resize(&input, bbox.as_ref());
        // a failing or panicking reader only loses the exif column
        let exif = match (&resized, exif_reader) {
            (Ok(_), Some(reader)) => std::panic::catch_unwind(AssertUnwindSafe(|| reader.extract(&input)))
                .ok()
                .flatten(),
            _ => None,
        };
        (resized, exif)
    })
    .await
    .map_err(ItemError::Resize)?;
    let image = match resized {
        Ok(image) => image,
        Err(message) => {
            return write_failure(ctx, str_key, columns, caption, SampleStatus::FailedToResize, message).await;
        }
    };

    ctx.tallies.successes.fetch_add(1, Ordering::SeqCst);
    ctx.counter.increment(SampleStatus::Success.as_str());

    let mut meta = SampleMeta::new(str_key.clone(), columns, SampleStatus::Success, None);
    meta.exif = exif;
    if let Some(algorithm) = ctx.config.compute_hash {
        meta.hash = Some((algorithm, algorithm.hex_digest(&payload)));
    }
    meta.width = Some(image.width);
    meta.height = Some(image.height);
    meta.original_width = Some(image.original_width);
    meta.original_height = Some(image.original_height);

    let record = meta.to_record(&ctx.schema);
    ctx.writer
        .write(Some(image.image), &str_key, caption, record)
        .await
        .map_err(ItemError::Write)
}

async fn write_failure(
    ctx: &ShardContext,
    str_key: String,
    columns: Vec<(String, Value)>,
    caption: Option<&str>,
    status: SampleStatus,
    message: String,
) -> Result<(), ItemError> {
    let tally = match status {
        SampleStatus::FailedToResize => &ctx.tallies.failed_to_resize,
        SampleStatus::FailedToDownload | SampleStatus::Success => &ctx.tallies.failed_to_download,
    };
    tally.fetch_add(1, Ordering::SeqCst);
    ctx.counter.increment(&message);

    let meta = SampleMeta::new(str_key.clone(), columns, status, Some(message));
    let record = meta.to_record(&ctx.schema);
    ctx.writer
        .write(None, &str_key, caption, record)
        .await
        .map_err(ItemError::Write)
}

/// Best-effort text of a panic payload.
pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::sample::{FieldKind, ResizeOutcome, SampleRecord};

    /// Holds every write until `gate` is closed.
    #[derive(Debug)]
    struct GatedWriter {
        entered: AtomicUsize,
        gate: Semaphore,
    }

    #[async_trait]
    impl SampleWriter for GatedWriter {
        async fn write(
            &self,
            _image: Option<Bytes>,
            _key: &str,
            _caption: Option<&str>,
            _record: SampleRecord,
        ) -> io::Result<()> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.acquire().await;
            Ok(())
        }

        async fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct NoResize;

    impl Resizer for NoResize {
        fn resize(&self, _payload: &[u8], _bbox: Option<&Value>) -> ResizeOutcome {
            Err("not an image".to_string())
        }
    }

    fn context(config: DownloaderConfig, writer: Arc<dyn SampleWriter>) -> ShardContext {
        let layout = ColumnLayout::new(&config).unwrap();
        let schema = Schema::from_columns(&config.column_list)
            .append("key", FieldKind::String)
            .append("status", FieldKind::String)
            .append("error_message", FieldKind::String);
        ShardContext {
            shard_id: 0,
            config: Arc::new(config),
            layout,
            schema,
            digits_per_shard: 4,
            writer,
            resizer: Arc::new(NoResize),
            exif: None,
            counter: CappedCounter::new(16),
            tallies: Tallies::default(),
        }
    }

    fn config(columns: &[&str]) -> DownloaderConfig {
        DownloaderConfig {
            column_list: columns.iter().map(ToString::to_string).collect(),
            ..DownloaderConfig::default()
        }
    }

    #[test]
    fn test_layout_locates_configured_columns() {
        let config = DownloaderConfig {
            verify_hash_type: Some(HashAlgorithm::Md5),
            blurring_bbox_col: Some("bbox".to_string()),
            ..config(&["caption", "url", "md5", "bbox"])
        };
        let layout = ColumnLayout::new(&config).unwrap();
        assert_eq!(layout.url, 1);
        assert_eq!(layout.caption, Some(0));
        assert_eq!(layout.verify, Some((HashAlgorithm::Md5, 2)));
        assert_eq!(layout.bbox, Some(3));
    }

    #[test]
    fn test_caption_ignored_when_not_saved() {
        let config = DownloaderConfig {
            save_caption: false,
            ..config(&["url", "caption"])
        };
        assert_eq!(ColumnLayout::new(&config).unwrap().caption, None);
    }

    #[test]
    fn test_meta_columns_skip_verification_column() {
        let config = DownloaderConfig {
            verify_hash_type: Some(HashAlgorithm::Sha256),
            ..config(&["url", "sha256", "caption"])
        };
        let layout = ColumnLayout::new(&config).unwrap();
        let row = ShardRow {
            key: 0,
            values: vec![json!("https://a.example/x.jpg"), json!("abc"), json!("a cat")],
        };
        let names: Vec<String> = layout.meta_columns(&row).into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["url", "caption"]);
    }

    #[test]
    fn test_gauge_tracks_peak_and_releases() {
        let semaphore = Arc::new(Semaphore::new(4));
        let gauge = Arc::new(InFlight::default());
        let first = InFlightPermit::new(Arc::clone(&semaphore).try_acquire_owned().unwrap(), Arc::clone(&gauge));
        let second = InFlightPermit::new(Arc::clone(&semaphore).try_acquire_owned().unwrap(), Arc::clone(&gauge));
        drop(first);
        drop(second);
        assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        assert_eq!(semaphore.available_permits(), 4);
    }

    #[test]
    fn test_panic_message_reads_str_and_string_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_worker_holds_permit_until_sample_is_written() {
        let writer = Arc::new(GatedWriter {
            entered: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        });
        let ctx = Arc::new(context(config(&["url"]), Arc::clone(&writer) as Arc<dyn SampleWriter>));
        let client = Arc::new(HttpClient::new(Duration::from_secs(1), None, BTreeSet::new()).unwrap());
        let semaphore = Arc::new(Semaphore::new(2));
        let gauge = Arc::new(InFlight::default());
        let (tx, rx) = mpsc::channel(1);
        let rx: RowReceiver = Arc::new(Mutex::new(rx));

        let permit = InFlightPermit::new(
            Arc::clone(&semaphore).acquire_owned().await.unwrap(),
            Arc::clone(&gauge),
        );
        let row = ShardRow {
            key: 0,
            values: vec![json!("not a url")],
        };
        tx.send((row, permit)).await.unwrap();
        drop(tx);
        let worker = tokio::spawn(work(0, Arc::clone(&ctx), rx, ItemFetcher::new(client, None, 0)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while writer.entered.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should reach the writer");
        assert_eq!(semaphore.available_permits(), 1);
        assert_eq!(gauge.current.load(Ordering::SeqCst), 1);

        writer.gate.close();
        worker.await.unwrap();
        assert_eq!(semaphore.available_permits(), 2);
        assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.tallies.failed_to_download.load(Ordering::SeqCst), 1);
    }
}
