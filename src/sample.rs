//! Per-sample results and the writer, resizer and EXIF contracts.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::hash::HashAlgorithm;

/// Terminal outcome of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Success,
    FailedToDownload,
    FailedToResize,
}

impl SampleStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::FailedToDownload => "failed_to_download",
            Self::FailedToResize => "failed_to_resize",
        }
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value type of an output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Passed through from the shard as-is.
    Input,
    String,
    Int32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

/// Ordered output columns handed to the writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Schema of the shard input.
    #[must_use]
    pub fn from_columns(columns: &[String]) -> Self {
        Self {
            fields: columns
                .iter()
                .map(|name| Field {
                    name: name.clone(),
                    kind: FieldKind::Input,
                })
                .collect(),
        }
    }

    /// Returns a copy extended with one column.
    #[must_use]
    pub fn append(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            kind,
        });
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.name == name)
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }
}

/// Fixed-shape record written for every sample.
pub type SampleRecord = Map<String, Value>;

/// Everything known about one processed sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMeta {
    /// Shard columns kept in the output, in `column_list` order.
    pub columns: Vec<(String, Value)>,
    pub key: String,
    pub status: SampleStatus,
    pub error_message: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub original_width: Option<u32>,
    pub original_height: Option<u32>,
    pub exif: Option<String>,
    /// Digest of the payload, for the computed-hash column.
    pub hash: Option<(HashAlgorithm, String)>,
}

impl SampleMeta {
    #[must_use]
    pub fn new(
        key: String,
        columns: Vec<(String, Value)>,
        status: SampleStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            columns,
            key,
            status,
            error_message,
            width: None,
            height: None,
            original_width: None,
            original_height: None,
            exif: None,
            hash: None,
        }
    }

    /// Lays the sample out as one value per `schema` column. Columns the
    /// sample has nothing for are `null`.
    #[must_use]
    pub fn to_record(&self, schema: &Schema) -> SampleRecord {
        schema
            .names()
            .map(|name| (name.to_string(), self.value_for(name)))
            .collect()
    }

    fn value_for(&self, name: &str) -> Value {
        let number = |value: Option<u32>| value.map_or(Value::Null, Value::from);
        match name {
            "key" => Value::from(self.key.clone()),
            "status" => Value::from(self.status.as_str()),
            "error_message" => self.error_message.clone().map_or(Value::Null, Value::from),
            "width" => number(self.width),
            "height" => number(self.height),
            "original_width" => number(self.original_width),
            "original_height" => number(self.original_height),
            "exif" => self.exif.clone().map_or(Value::Null, Value::from),
            _ => {
                if let Some((algorithm, digest)) = &self.hash
                    && algorithm.name() == name
                {
                    return Value::from(digest.clone());
                }
                self.columns
                    .iter()
                    .find(|(column, _)| column == name)
                    .map_or(Value::Null, |(_, value)| value.clone())
            }
        }
    }
}

/// Construction parameters of a per-shard writer.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterSpec {
    pub shard_id: u64,
    pub output_folder: PathBuf,
    pub save_caption: bool,
    pub oom_shard_count: u32,
    pub schema: Schema,
    pub encode_format: String,
}

/// Creates one writer per shard.
#[async_trait]
pub trait SampleWriterFactory: Send + Sync + std::fmt::Debug {
    async fn create(&self, spec: WriterSpec) -> std::io::Result<Arc<dyn SampleWriter>>;
}

/// Persists samples of one shard.
///
/// Called concurrently from every worker, in completion order.
#[async_trait]
pub trait SampleWriter: Send + Sync + std::fmt::Debug {
    async fn write(
        &self,
        image: Option<Bytes>,
        key: &str,
        caption: Option<&str>,
        record: SampleRecord,
    ) -> std::io::Result<()>;

    /// Finalizes the shard output. Called once, after the last `write`.
    async fn close(&self) -> std::io::Result<()>;
}

/// A resized image and its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizedImage {
    pub image: Bytes,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
}

/// Resized image, or the resizer's error message.
pub type ResizeOutcome = Result<ResizedImage, String>;

/// Decodes, resizes and re-encodes a payload. CPU-bound; called on the
/// blocking pool.
pub trait Resizer: Send + Sync + std::fmt::Debug {
    /// `bbox` is the blur bounding-box cell of the row, when configured.
    fn resize(&self, payload: &[u8], bbox: Option<&Value>) -> ResizeOutcome;
}

/// Extracts EXIF tags as a JSON string. `None` on any failure.
pub trait ExifReader: Send + Sync + std::fmt::Debug {
    fn extract(&self, payload: &[u8]) -> Option<String>;
}
