//! # ja-store — Record Store Adapter
//!
//! Typed, streaming read access to the canonical job-posting dataset.
//!
//! - [`RecordStore`] is the outbound interface every backing store
//!   implements: `fetch` a lazy stream of raw records, `count` them, and
//!   optionally `ingest` new batches.
//! - [`normalize`] turns heterogeneous raw records into [`JobPosting`]s.
//! - [`RecordAdapter`] glues the two: it yields postings, skips (and
//!   counts) records that fail normalization, and applies in-process any
//!   filter the store could not push down.
//!
//! [`JobPosting`]: ja_core::JobPosting

pub mod adapter;
pub mod json_dir;
pub mod memory;
pub mod normalize;

pub use adapter::{PostingStream, RecordAdapter};
pub use json_dir::JsonDirStore;
pub use memory::MemoryStore;

use futures::stream::BoxStream;
use ja_core::{AnalyticsError, FilterSet, TimeWindow};
use serde::Serialize;
use thiserror::Error;

/// A record exactly as the store holds it.
pub type RawRecord = serde_json::Value;

/// Lazy stream of raw records. Each call to [`RecordStore::fetch`] starts a
/// fresh stream from the beginning of the dataset.
pub type RawRecordStream = BoxStream<'static, Result<RawRecord, StoreError>>;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store '{store}' is unavailable: {reason}")]
    Unavailable { store: String, reason: String },

    #[error("batch file {file} is corrupt: {reason}")]
    CorruptBatch { file: String, reason: String },

    #[error("invalid ingestion batch: {0}")]
    InvalidBatch(String),

    #[error("store '{0}' does not accept ingestion")]
    ReadOnly(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for AnalyticsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { .. } | StoreError::Io(_) => {
                AnalyticsError::StoreUnavailable(err.to_string())
            }
            other => AnalyticsError::Internal(other.to_string()),
        }
    }
}

// =============================================================================
// Store interface
// =============================================================================

/// Push-down hint passed to the store. Backends may ignore any part of it;
/// [`RecordStore::pushdown`] says which parts they honour.
#[derive(Debug, Clone, Default)]
pub struct StoreQuery {
    pub window: Option<TimeWindow>,
    pub filters: FilterSet,
}

/// Which parts of a [`StoreQuery`] a backend applies itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Pushdown {
    pub window: bool,
    pub filters: bool,
}

/// The core trait every backing store must implement.
///
/// Window push-down is conservative: a record whose date cannot be read is
/// always returned, so the adapter gets to count it as skipped.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Identifier used as the default posting `source` and in logs.
    fn name(&self) -> &str;

    fn pushdown(&self) -> Pushdown;

    /// Start a lazy stream over the records matching `query` (as far as
    /// the backend pushes it down).
    async fn fetch(&self, query: &StoreQuery) -> Result<RawRecordStream, StoreError>;

    async fn count(&self, query: &StoreQuery) -> Result<u64, StoreError>;

    /// Cheap value that changes whenever the underlying dataset changes.
    /// Polled by the planner to notice batches that landed out of band.
    async fn fingerprint(&self) -> Result<u64, StoreError>;

    /// Append a batch of raw records. Returns how many were stored.
    async fn ingest(&self, _batch: Vec<RawRecord>) -> Result<usize, StoreError> {
        Err(StoreError::ReadOnly(self.name().to_string()))
    }
}

/// Conservative window check on a raw record, shared by backends that
/// push the window down.
pub(crate) fn raw_in_window(record: &RawRecord, window: Option<&TimeWindow>) -> bool {
    match (window, normalize::raw_posted_on(record)) {
        (Some(w), Some(day)) => w.contains(day),
        _ => true,
    }
}
