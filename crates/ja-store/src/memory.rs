//! # In-Memory Store
//!
//! Vector-backed [`RecordStore`]. Ingestion is copy-on-write: a running
//! `fetch` keeps iterating the snapshot it started with while new batches
//! land in a fresh vector.

use crate::{raw_in_window, Pushdown, RawRecord, RawRecordStream, RecordStore, StoreError, StoreQuery};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub struct MemoryStore {
    name: String,
    records: RwLock<Arc<Vec<RawRecord>>>,
    available: AtomicBool,
    fetch_delay: Option<Duration>,
    /// Bumped on every ingested batch; doubles as the fingerprint.
    batches: AtomicU64,
    fetches_total: AtomicU64,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(Arc::new(Vec::new())),
            available: AtomicBool::new(true),
            fetch_delay: None,
            batches: AtomicU64::new(0),
            fetches_total: AtomicU64::new(0),
        }
    }

    pub fn with_records(name: impl Into<String>, records: Vec<RawRecord>) -> Self {
        let store = Self::new(name);
        store.batches.store(1, Ordering::Relaxed);
        Self {
            records: RwLock::new(Arc::new(records)),
            ..store
        }
    }

    /// Every `fetch` sleeps this long before yielding its stream.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Number of `fetch` calls served so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches_total.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                store: self.name.clone(),
                reason: "store marked offline".into(),
            })
        }
    }

    async fn snapshot(&self) -> Arc<Vec<RawRecord>> {
        self.records.read().await.clone()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn pushdown(&self) -> Pushdown {
        Pushdown {
            window: true,
            filters: false,
        }
    }

    async fn fetch(&self, query: &StoreQuery) -> Result<RawRecordStream, StoreError> {
        self.ensure_available()?;
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        self.fetches_total.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.snapshot().await;
        let window = query.window;
        let records = (0..snapshot.len()).filter_map(move |i| {
            let record = &snapshot[i];
            raw_in_window(record, window.as_ref()).then(|| Ok::<_, StoreError>(record.clone()))
        });
        Ok(stream::iter(records).boxed())
    }

    async fn count(&self, query: &StoreQuery) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let snapshot = self.snapshot().await;
        let n = snapshot
            .iter()
            .filter(|r| raw_in_window(r, query.window.as_ref()))
            .count();
        Ok(n as u64)
    }

    async fn fingerprint(&self) -> Result<u64, StoreError> {
        self.ensure_available()?;
        Ok(self.batches.load(Ordering::Relaxed))
    }

    async fn ingest(&self, batch: Vec<RawRecord>) -> Result<usize, StoreError> {
        self.ensure_available()?;
        if let Some(pos) = batch.iter().position(|r| !r.is_object()) {
            return Err(StoreError::InvalidBatch(format!(
                "record {} is not a JSON object",
                pos
            )));
        }
        let accepted = batch.len();
        let mut guard = self.records.write().await;
        Arc::make_mut(&mut guard).extend(batch);
        self.batches.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Memory store '{}' ingested {} records", self.name, accepted);
        Ok(accepted)
    }
}
