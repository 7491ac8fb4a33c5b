//! Shard input: descriptors, batches and the reader contract.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

/// What the orchestrator hands the downloader for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: u64,
    /// Opaque location of the shard input, interpreted by the reader.
    pub locator: String,
}

impl ShardDescriptor {
    #[must_use]
    pub fn new(shard_id: u64, locator: impl Into<String>) -> Self {
        Self {
            shard_id,
            locator: locator.into(),
        }
    }
}

/// Columnar shard content as read from storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardBatch {
    pub columns: Vec<String>,
    /// One entry per row, values in `columns` order.
    pub rows: Vec<Vec<Value>>,
}

/// One item to download: its ordinal plus projected column values.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRow {
    pub key: u64,
    pub values: Vec<Value>,
}

/// Failure reading, parsing or removing shard input.
#[derive(Debug, Error)]
pub enum ShardReadError {
    #[error("IO error on shard {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in shard {path} at line {line}: {source}")]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("shard {path} has no header line")]
    MissingHeader { path: PathBuf },

    #[error("row at line {line} of shard {path} has {found} values, header has {expected}")]
    RowWidth {
        path: PathBuf,
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("shard has no column `{0}`")]
    MissingColumn(String),
}

impl ShardBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Keeps only `columns`, in that order, numbering rows by position.
    ///
    /// # Errors
    ///
    /// Returns [`ShardReadError::MissingColumn`] for a column the batch
    /// does not have.
    pub fn project(&self, columns: &[String]) -> Result<Vec<ShardRow>, ShardReadError> {
        let indices = columns
            .iter()
            .map(|name| {
                self.column_index(name)
                    .ok_or_else(|| ShardReadError::MissingColumn(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self
            .rows
            .iter()
            .zip(0u64..)
            .map(|(row, key)| ShardRow {
                key,
                values: indices
                    .iter()
                    .map(|&index| row.get(index).cloned().unwrap_or(Value::Null))
                    .collect(),
            })
            .collect())
    }
}

/// Reads a shard and deletes it once processed.
#[async_trait]
pub trait ShardReader: Send + Sync + std::fmt::Debug {
    /// Loads the whole shard at `locator`.
    async fn read(&self, locator: &str) -> Result<ShardBatch, ShardReadError>;

    /// Deletes the shard input after a successful run.
    async fn remove(&self, locator: &str) -> Result<(), ShardReadError>;
}

/// Reads local JSON-lines shards.
///
/// The first non-empty line is a JSON array of column names; every further
/// non-empty line is a JSON array with one value per column:
///
/// ```text
/// ["url", "caption"]
/// ["https://example.com/a.jpg", "a cat"]
/// ["https://example.com/b.jpg", null]
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesShardReader;

impl JsonLinesShardReader {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn parse(path: &Path, content: &str) -> Result<ShardBatch, ShardReadError> {
        let mut lines = content
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        let Some((header_line, header)) = lines.next() else {
            return Err(ShardReadError::MissingHeader { path: path.to_path_buf() });
        };
        let columns: Vec<String> =
            serde_json::from_str(header).map_err(|source| ShardReadError::Json {
                path: path.to_path_buf(),
                line: header_line,
                source,
            })?;

        let mut rows = Vec::new();
        for (line, text) in lines {
            let row: Vec<Value> =
                serde_json::from_str(text).map_err(|source| ShardReadError::Json {
                    path: path.to_path_buf(),
                    line,
                    source,
                })?;
            if row.len() != columns.len() {
                return Err(ShardReadError::RowWidth {
                    path: path.to_path_buf(),
                    line,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
            rows.push(row);
        }

        Ok(ShardBatch { columns, rows })
    }
}

#[async_trait]
impl ShardReader for JsonLinesShardReader {
    #[instrument(skip(self))]
    async fn read(&self, locator: &str) -> Result<ShardBatch, ShardReadError> {
        let path = PathBuf::from(locator);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ShardReadError::Io {
                path: path.clone(),
                source,
            })?;
        let batch = Self::parse(&path, &content)?;
        debug!(rows = batch.len(), columns = batch.columns.len(), "read shard");
        Ok(batch)
    }

    async fn remove(&self, locator: &str) -> Result<(), ShardReadError> {
        tokio::fs::remove_file(locator)
            .await
            .map_err(|source| ShardReadError::Io {
                path: PathBuf::from(locator),
                source,
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn batch() -> ShardBatch {
        ShardBatch {
            columns: vec!["caption".into(), "url".into(), "md5".into()],
            rows: vec![
                vec![json!("a cat"), json!("https://a.example/1.jpg"), json!("abc")],
                vec![json!(null), json!("https://b.example/2.jpg"), json!("def")],
            ],
        }
    }

    #[test]
    fn test_project_reorders_and_numbers_rows() {
        let rows = batch()
            .project(&["url".to_string(), "caption".to_string()])
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, 0);
        assert_eq!(rows[1].key, 1);
        assert_eq!(rows[0].values, vec![json!("https://a.example/1.jpg"), json!("a cat")]);
        assert_eq!(rows[1].values[1], Value::Null);
    }

    #[test]
    fn test_project_missing_column() {
        let err = batch().project(&["width".to_string()]).unwrap_err();
        assert!(matches!(err, ShardReadError::MissingColumn(ref c) if c == "width"));
    }

    #[tokio::test]
    async fn test_json_lines_reader_reads_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard_00000.jsonl");
        std::fs::write(
            &path,
            "[\"url\", \"caption\"]\n\n[\"https://a.example/1.jpg\", \"one\"]\n[\"https://a.example/2.jpg\", null]\n",
        )
        .unwrap();
        let locator = path.to_string_lossy().to_string();
        let reader = JsonLinesShardReader::new();

        let batch = reader.read(&locator).await.unwrap();
        assert_eq!(batch.columns, vec!["url", "caption"]);
        assert_eq!(batch.len(), 2);

        reader.remove(&locator).await.unwrap();
        assert!(!path.exists());
        assert!(matches!(
            reader.read(&locator).await.unwrap_err(),
            ShardReadError::Io { .. }
        ));
    }

    #[tokio::test]
    async fn test_json_lines_reader_rejects_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "[\"url\", \"caption\"]\n[\"https://a.example/1.jpg\"]\n").unwrap();

        let err = JsonLinesShardReader
            .read(&path.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardReadError::RowWidth {
                line: 2,
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_json_lines_reader_empty_file_has_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.jsonl");
        std::fs::write(&path, "\n").unwrap();
        let err = JsonLinesShardReader
            .read(&path.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, ShardReadError::MissingHeader { .. }));
    }
}
