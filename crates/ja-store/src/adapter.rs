//! # Record Adapter
//!
//! Typed view over a [`RecordStore`]: raw records go in, normalized
//! [`JobPosting`]s come out. Records that fail normalization are logged,
//! skipped and counted, never fatal.

use crate::normalize::normalize;
use crate::{raw_in_window, RawRecord, RawRecordStream, RecordStore, StoreQuery};
use futures::stream::{Stream, StreamExt};
use ja_core::{AnalyticsError, FilterSet, JobPosting, TimeWindow};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone)]
pub struct RecordAdapter {
    store: Arc<dyn RecordStore>,
}

/// Coverage numbers for a window: raw records the store holds, how many of
/// them normalize and pass the filters, and how many were malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCount {
    pub raw: u64,
    pub matching: u64,
    pub skipped: u64,
}

impl RecordAdapter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Start a fresh, lazy stream of postings inside `window` matching
    /// `filters`. Every call restarts from the beginning of the dataset.
    pub async fn fetch_records(
        &self,
        filters: &FilterSet,
        window: &TimeWindow,
    ) -> Result<PostingStream, AnalyticsError> {
        window.validate()?;
        let filters = filters.normalized();
        let query = StoreQuery {
            window: Some(*window),
            filters: filters.clone(),
        };
        let pushdown = self.store.pushdown();
        let inner = self.store.fetch(&query).await.map_err(|e| {
            tracing::warn!("Store '{}' fetch failed: {}", self.store.name(), e);
            AnalyticsError::from(e)
        })?;

        Ok(PostingStream {
            inner,
            source: self.store.name().to_string(),
            window: (!pushdown.window).then_some(*window),
            filters: (!pushdown.filters).then_some(filters),
            skipped: 0,
        })
    }

    pub async fn count(
        &self,
        filters: &FilterSet,
        window: &TimeWindow,
    ) -> Result<RecordCount, AnalyticsError> {
        let query = StoreQuery {
            window: Some(*window),
            filters: filters.normalized(),
        };
        let raw = self.store.count(&query).await?;
        let mut postings = self.fetch_records(filters, window).await?;
        let mut matching = 0u64;
        while let Some(posting) = postings.next().await {
            posting?;
            matching += 1;
        }
        Ok(RecordCount {
            raw,
            matching,
            skipped: postings.skipped(),
        })
    }

    pub async fn ingest(&self, batch: Vec<RawRecord>) -> Result<usize, AnalyticsError> {
        Ok(self.store.ingest(batch).await?)
    }

    pub async fn fingerprint(&self) -> Result<u64, AnalyticsError> {
        Ok(self.store.fingerprint().await?)
    }
}

/// Stream of normalized postings. Store failures are yielded as errors;
/// malformed records are not, they only bump [`PostingStream::skipped`].
pub struct PostingStream {
    inner: RawRecordStream,
    source: String,
    /// Checks the store did not push down.
    window: Option<TimeWindow>,
    filters: Option<FilterSet>,
    skipped: u64,
}

impl PostingStream {
    /// Records dropped by normalization so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn keeps(&self, posting: &JobPosting) -> bool {
        let in_window = self
            .window
            .map_or(true, |w| w.contains(posting.posted_on()));
        in_window && self.filters.as_ref().map_or(true, |f| f.matches(posting))
    }
}

impl Stream for PostingStream {
    type Item = Result<JobPosting, AnalyticsError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let raw = match this.inner.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(Some(Ok(raw))) => raw,
            };
            match normalize(&raw, &this.source) {
                Ok(posting) if this.keeps(&posting) => return Poll::Ready(Some(Ok(posting))),
                Ok(_) => {}
                // A malformed record dated outside the window would never
                // have reached us from a store that filters by window.
                Err(_) if !raw_in_window(&raw, this.window.as_ref()) => {}
                Err(e) => {
                    this.skipped += 1;
                    tracing::debug!("Skipping record from '{}': {}", this.source, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JsonDirStore, MemoryStore};
    use chrono::NaiveDate;
    use serde_json::json;

    fn january() -> TimeWindow {
        TimeWindow::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        )
    }

    fn records() -> Vec<RawRecord> {
        vec![
            json!({"id": "1", "company": "Acme", "posted_at": "2024-01-02", "skills": ["Rust"]}),
            json!({"id": "2", "company": "Initech", "posted_at": "2024-01-03"}),
            json!({"company": "NoId", "posted_at": "2024-01-04"}),
            json!({"id": "4", "posted_at": "yesterday"}),
            json!({"id": "5", "company": "Acme", "posted_at": "2023-06-01"}),
        ]
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped_and_counted() {
        let adapter = RecordAdapter::new(Arc::new(MemoryStore::with_records("mem", records())));
        let mut stream = adapter
            .fetch_records(&FilterSet::default(), &january())
            .await
            .unwrap();
        let mut ids = Vec::new();
        while let Some(p) = stream.next().await {
            ids.push(p.unwrap().id);
        }
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(stream.skipped(), 2);
    }

    #[tokio::test]
    async fn test_filters_applied_when_not_pushed_down() {
        let adapter = RecordAdapter::new(Arc::new(MemoryStore::with_records("mem", records())));
        let filters = FilterSet {
            company: Some("ACME".into()),
            ..Default::default()
        };
        let postings: Vec<_> = adapter
            .fetch_records(&filters, &january())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].as_ref().unwrap().source, "mem");
    }

    #[tokio::test]
    async fn test_window_applied_for_store_without_pushdown() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("a.json"),
            serde_json::to_vec(&records()).unwrap(),
        )
        .unwrap();
        let adapter = RecordAdapter::new(Arc::new(JsonDirStore::new(tmp.path())));
        let count = adapter.count(&FilterSet::default(), &january()).await.unwrap();
        // "yesterday" and the id-less record are skipped; June 2023 is outside.
        assert_eq!(count.matching, 2);
        assert_eq!(count.skipped, 2);
        assert_eq!(count.raw, 4);
    }

    #[tokio::test]
    async fn test_skipped_count_does_not_depend_on_pushdown() {
        let batch = vec![
            json!({"id": "1", "posted_at": "2024-01-02"}),
            json!({"company": "NoId", "posted_at": "2019-05-05"}),
            json!({"company": "NoIdNoDate"}),
        ];
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.json"), serde_json::to_vec(&batch).unwrap()).unwrap();

        let memory = RecordAdapter::new(Arc::new(MemoryStore::with_records("mem", batch)));
        let dir = RecordAdapter::new(Arc::new(JsonDirStore::new(tmp.path())));
        for adapter in [memory, dir] {
            let mut stream = adapter
                .fetch_records(&FilterSet::default(), &january())
                .await
                .unwrap();
            let mut matching = 0;
            while let Some(p) = stream.next().await {
                p.unwrap();
                matching += 1;
            }
            assert_eq!(matching, 1, "{}", adapter.store().name());
            // Only the undated record can fall in the window.
            assert_eq!(stream.skipped(), 1, "{}", adapter.store().name());

            let count = adapter.count(&FilterSet::default(), &january()).await.unwrap();
            assert_eq!((count.matching, count.skipped), (1, 1));
        }
    }

    #[tokio::test]
    async fn test_unavailable_store_maps_to_store_unavailable() {
        let store = Arc::new(MemoryStore::with_records("mem", records()));
        store.set_available(false);
        let adapter = RecordAdapter::new(store);
        let err = adapter
            .fetch_records(&FilterSet::default(), &january())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "store_unavailable");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_inverted_window_rejected_before_store_io() {
        let store = Arc::new(MemoryStore::with_records("mem", records()));
        let adapter = RecordAdapter::new(store.clone());
        let inverted = TimeWindow::new(january().end, january().start);
        let err = adapter
            .fetch_records(&FilterSet::default(), &inverted)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "invalid_window");
        assert_eq!(store.fetch_count(), 0);
    }
}
