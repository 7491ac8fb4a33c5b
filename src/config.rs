//! Downloader configuration: defaults, JSON loading and validation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dns::CacheBackend;
use crate::dns::error::StoreError;
use crate::dns::store::redis_url;
use crate::hash::{HashAlgorithm, UnknownHashAlgorithm};
use crate::key::{MAX_KEY_DIGITS, digits_for_capacity};
use crate::status::DEFAULT_COUNTER_CAPACITY;

/// Largest accepted worker count.
pub const MAX_THREAD_COUNT: usize = 1024;

/// Invalid or unusable configuration. Fatal at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unrecognized DNS cache backend tag.
    #[error("Invalid DNS cache type: {0}")]
    InvalidCacheBackend(String),

    /// Unrecognized digest name.
    #[error(transparent)]
    InvalidHash(#[from] UnknownHashAlgorithm),

    /// Hash verification requested but its reference column is not read.
    #[error("verification column `{column}` is not in column_list")]
    VerifyColumnMissing {
        /// Expected column name.
        column: String,
    },

    /// The blur bounding-box column is not read.
    #[error("blurring bbox column `{column}` is not in column_list")]
    BboxColumnMissing {
        /// Expected column name.
        column: String,
    },

    /// The url column is mandatory.
    #[error("column_list must contain `url`")]
    MissingUrlColumn,

    #[error("Invalid config value for `thread_count`: {0}. Expected range: 1..={MAX_THREAD_COUNT}")]
    InvalidThreadCount(usize),

    #[error("Invalid config value for `{field}`: {value}. Expected a value >= 1")]
    NotPositive {
        field: &'static str,
        value: u64,
    },

    /// Sample keys would not fit in [`MAX_KEY_DIGITS`] digits.
    #[error(
        "Invalid config value: sample keys need {digits} digits \
         (number_sample_per_shard and oom_shard_count). Expected at most {MAX_KEY_DIGITS}"
    )]
    KeyTooWide { digits: u32 },

    /// The remote cache backend needs a store.
    #[error("DNS cache type `remote` requires a store (set dns_cache_host or dns_cache_path)")]
    RemoteStoreMissing,

    /// The remote cache host is not a usable Redis address.
    #[error("Invalid config value for `dns_cache_host`: {0}. Expected a host, host:port or redis:// URL")]
    InvalidCacheHost(String),

    /// The remote store could not be opened.
    #[error("failed to open remote DNS cache store: {0}")]
    RemoteStore(#[from] StoreError),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything the shard downloader needs to know.
///
/// Deserializes from JSON with every field optional; missing fields take
/// the [`Default`] value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Concurrent fetch workers per shard.
    pub thread_count: usize,
    /// Forward the `caption` column to the writer.
    pub save_caption: bool,
    pub extract_exif: bool,
    pub output_folder: PathBuf,
    /// Columns read from each shard. Must contain `url`.
    pub column_list: Vec<String>,
    /// Per-request HTTP timeout.
    pub timeout_secs: u64,
    /// Per-shard item capacity, sizes the ordinal part of sample keys.
    pub number_sample_per_shard: u64,
    /// Digits reserved for the shard id in sample keys.
    pub oom_shard_count: u32,
    /// Digest attached to every successful sample.
    pub compute_hash: Option<HashAlgorithm>,
    /// Digest checked against the column of the same name.
    pub verify_hash_type: Option<HashAlgorithm>,
    pub encode_format: String,
    /// Extra fetch attempts per item.
    pub retries: u32,
    pub user_agent_token: Option<String>,
    /// `X-Robots-Tag` directives that make an image unusable. Empty skips
    /// the check.
    pub disallowed_header_directives: BTreeSet<String>,
    /// Column carrying blur bounding boxes for the resizer.
    pub blurring_bbox_col: Option<String>,
    /// Resolve hosts through the public nameserver pool first.
    pub use_public_dns: bool,
    /// Extra nameservers tried per resolution.
    pub dns_num_retries: u32,
    pub dns_cache_type: CacheBackend,
    /// Redis server backing the remote cache. Takes precedence over
    /// `dns_cache_path`.
    pub dns_cache_host: Option<String>,
    /// SQLite file backing the remote cache on a single host.
    pub dns_cache_path: Option<PathBuf>,
    /// Distinct labels tracked by the status counter.
    pub status_counter_capacity: usize,
    /// Per-query nameserver timeout.
    pub dns_timeout_ms: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            thread_count: 32,
            save_caption: true,
            extract_exif: false,
            output_folder: PathBuf::from("output"),
            column_list: vec!["url".to_string()],
            timeout_secs: 10,
            number_sample_per_shard: 10_000,
            oom_shard_count: 5,
            compute_hash: Some(HashAlgorithm::Sha256),
            verify_hash_type: None,
            encode_format: "jpg".to_string(),
            retries: 0,
            user_agent_token: None,
            disallowed_header_directives: BTreeSet::new(),
            blurring_bbox_col: None,
            use_public_dns: false,
            dns_num_retries: 0,
            dns_cache_type: CacheBackend::default(),
            dns_cache_host: None,
            dns_cache_path: None,
            status_counter_capacity: DEFAULT_COUNTER_CAPACITY,
            dns_timeout_ms: 2000,
        }
    }
}

impl DownloaderConfig {
    /// Loads, normalizes and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// any value fails [`DownloaderConfig::validate`].
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Trims and lowercases the user-agent token and directive set.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.user_agent_token = self
            .user_agent_token
            .map(|token| token.trim().to_lowercase())
            .filter(|token| !token.is_empty());
        self.disallowed_header_directives = self
            .disallowed_header_directives
            .iter()
            .map(|directive| directive.trim().to_lowercase())
            .filter(|directive| !directive.is_empty())
            .collect();
        self
    }

    /// Checks values against runtime constraints.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_THREAD_COUNT).contains(&self.thread_count) {
            return Err(ConfigError::InvalidThreadCount(self.thread_count));
        }
        if !self.column_list.iter().any(|column| column == "url") {
            return Err(ConfigError::MissingUrlColumn);
        }
        if let Some(verify) = self.verify_hash_type
            && !self.column_list.iter().any(|column| column == verify.name())
        {
            return Err(ConfigError::VerifyColumnMissing {
                column: verify.name().to_string(),
            });
        }
        if let Some(column) = &self.blurring_bbox_col
            && !self.column_list.contains(column)
        {
            return Err(ConfigError::BboxColumnMissing {
                column: column.clone(),
            });
        }
        validate_positive("timeout_secs", self.timeout_secs)?;
        validate_positive("number_sample_per_shard", self.number_sample_per_shard)?;
        validate_positive("dns_timeout_ms", self.dns_timeout_ms)?;
        let digits = digits_for_capacity(self.number_sample_per_shard).saturating_add(self.oom_shard_count);
        if digits > MAX_KEY_DIGITS {
            return Err(ConfigError::KeyTooWide { digits });
        }
        validate_positive(
            "status_counter_capacity",
            u64::try_from(self.status_counter_capacity).unwrap_or(u64::MAX),
        )?;
        if let Some(host) = &self.dns_cache_host
            && redis_url(host).is_none()
        {
            return Err(ConfigError::InvalidCacheHost(host.clone()));
        }
        if self.use_public_dns
            && self.dns_cache_type == CacheBackend::Remote
            && self.dns_cache_host.is_none()
            && self.dns_cache_path.is_none()
        {
            return Err(ConfigError::RemoteStoreMissing);
        }
        Ok(())
    }

    /// Column holding the verification reference digest, if any.
    #[must_use]
    pub fn verify_column(&self) -> Option<&'static str> {
        self.verify_hash_type.map(HashAlgorithm::name)
    }
}

fn validate_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { field, value });
    }
    Ok(())
}
