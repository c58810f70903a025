//! # JSON Directory Store
//!
//! A directory of batch files, each holding either `{"items": [...]}` (the
//! layout of saved hh.ru search pages) or a bare JSON array. Files are
//! visited in file-name order and read one at a time, so a fetch never
//! holds more than one batch in memory.

use crate::{raw_in_window, Pushdown, RawRecord, RawRecordStream, RecordStore, StoreError, StoreQuery};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

pub struct JsonDirStore {
    name: String,
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let name = format!(
            "json_dir:{}",
            dir.file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".into())
        );
        Self { name, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Batch files currently in the directory, sorted by name.
    async fn batch_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::Unavailable {
                store: self.name.clone(),
                reason: format!("{}: {}", self.dir.display(), e),
            })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Parse one batch file into its records.
fn parse_batch(file: &Path, bytes: &[u8]) -> Result<Vec<RawRecord>, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptBatch {
        file: file.display().to_string(),
        reason,
    };
    match serde_json::from_slice::<Value>(bytes).map_err(|e| corrupt(e.to_string()))? {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => match obj.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(corrupt("object batch without an 'items' array".into())),
        },
        _ => Err(corrupt("expected an array or an object with 'items'".into())),
    }
}

struct ReadState {
    files: VecDeque<PathBuf>,
    pending: VecDeque<RawRecord>,
}

async fn next_record(mut state: ReadState) -> Option<(Result<RawRecord, StoreError>, ReadState)> {
    loop {
        if let Some(record) = state.pending.pop_front() {
            return Some((Ok(record), state));
        }
        let file = state.files.pop_front()?;
        let loaded = match tokio::fs::read(&file).await {
            Ok(bytes) => parse_batch(&file, &bytes),
            Err(e) => Err(StoreError::Io(e)),
        };
        match loaded {
            Ok(records) => state.pending = records.into(),
            Err(e) => {
                // The stream ends after reporting the failure.
                state.files.clear();
                return Some((Err(e), state));
            }
        }
    }
}

#[async_trait::async_trait]
impl RecordStore for JsonDirStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn pushdown(&self) -> Pushdown {
        Pushdown::default()
    }

    /// Nothing is pushed down: every record of every batch is yielded.
    async fn fetch(&self, _query: &StoreQuery) -> Result<RawRecordStream, StoreError> {
        let files = self.batch_files().await?;
        tracing::debug!("Store '{}' streaming {} batch files", self.name, files.len());
        let state = ReadState {
            files: files.into(),
            pending: VecDeque::new(),
        };
        Ok(stream::unfold(state, next_record).boxed())
    }

    async fn count(&self, query: &StoreQuery) -> Result<u64, StoreError> {
        let mut stream = self.fetch(query).await?;
        let mut n = 0u64;
        while let Some(record) = stream.next().await {
            if raw_in_window(&record?, query.window.as_ref()) {
                n += 1;
            }
        }
        Ok(n)
    }

    /// CRC32 over every batch file's name, size and modification time.
    async fn fingerprint(&self) -> Result<u64, StoreError> {
        let mut hasher = crc32fast::Hasher::new();
        for file in self.batch_files().await? {
            let meta = tokio::fs::metadata(&file).await?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            hasher.update(file.to_string_lossy().as_bytes());
            hasher.update(&meta.len().to_le_bytes());
            hasher.update(&mtime.to_le_bytes());
        }
        Ok(hasher.finalize() as u64)
    }

    /// Writes the batch as a new file. The write goes to a temporary name
    /// first so a concurrent fetch never sees a half-written batch.
    async fn ingest(&self, batch: Vec<RawRecord>) -> Result<usize, StoreError> {
        if let Some(pos) = batch.iter().position(|r| !r.is_object()) {
            return Err(StoreError::InvalidBatch(format!(
                "record {} is not a JSON object",
                pos
            )));
        }
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Err(StoreError::Unavailable {
                store: self.name.clone(),
                reason: format!("{} does not exist", self.dir.display()),
            });
        }

        let stem = format!(
            "batch-{}-{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"),
            uuid::Uuid::new_v4().as_simple()
        );
        let tmp = self.dir.join(format!("{}.json.tmp", stem));
        let path = self.dir.join(format!("{}.json", stem));

        let accepted = batch.len();
        let body = serde_json::to_vec(&serde_json::json!({ "items": batch }))
            .map_err(|e| StoreError::InvalidBatch(e.to_string()))?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::info!(
            "Store '{}' wrote {} records to {}",
            self.name,
            accepted,
            path.display()
        );
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ja_core::TimeWindow;
    use serde_json::json;

    fn write(dir: &Path, name: &str, body: Value) {
        std::fs::write(dir.join(name), serde_json::to_vec(&body).unwrap()).unwrap();
    }

    async fn ids(store: &JsonDirStore) -> Vec<String> {
        store
            .fetch(&StoreQuery::default())
            .await
            .unwrap()
            .map(|r| r.unwrap()["id"].to_string())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_reads_both_layouts_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "b.json", json!([{"id": 3}]));
        write(tmp.path(), "a.json", json!({"items": [{"id": 1}, {"id": 2}], "found": 2}));
        write(tmp.path(), "notes.txt", json!("ignored"));

        let store = JsonDirStore::new(tmp.path());
        assert_eq!(ids(&store).await, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(tmp.path().join("nope"));
        assert!(matches!(
            store.fetch(&StoreQuery::default()).await,
            Err(StoreError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_batch_ends_stream_with_error() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.json", json!([{"id": 1}]));
        std::fs::write(tmp.path().join("b.json"), b"{\"items\": [").unwrap();
        write(tmp.path(), "c.json", json!([{"id": 9}]));

        let store = JsonDirStore::new(tmp.path());
        let results: Vec<_> = store.fetch(&StoreQuery::default()).await.unwrap().collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StoreError::CorruptBatch { .. })));
    }

    #[tokio::test]
    async fn test_ingest_adds_a_batch_and_changes_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(tmp.path());
        let before = store.fingerprint().await.unwrap();

        let n = store
            .ingest(vec![json!({"id": "x", "posted_at": "2024-01-02"})])
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_ne!(store.fingerprint().await.unwrap(), before);
        assert_eq!(ids(&store).await, vec!["\"x\""]);

        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_count_respects_window() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "a.json",
            json!([
                {"id": 1, "posted_at": "2024-01-05"},
                {"id": 2, "posted_at": "2023-12-31"},
            ]),
        );
        let store = JsonDirStore::new(tmp.path());
        let query = StoreQuery {
            window: Some(TimeWindow::new(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            )),
            ..Default::default()
        };
        assert_eq!(store.count(&query).await.unwrap(), 1);
        assert_eq!(store.count(&StoreQuery::default()).await.unwrap(), 2);
    }
}
