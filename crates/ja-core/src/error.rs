//! # Error Taxonomy
//!
//! One error type shared by the adapter, the engine and the planner. It is
//! `Clone` because a single failed computation is handed to every request
//! waiting on it.

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyticsError {
    /// A raw record could not be turned into a [`crate::JobPosting`].
    /// Recovered locally by the adapter (skip + count).
    #[error("record {record} does not match the posting schema: {reason}")]
    SchemaMismatch { record: String, reason: String },

    /// The backing store could not be reached. Retryable.
    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid time window: start {start} is after end {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error("unsupported dimension: {0}")]
    UnsupportedDimension(String),

    /// A volume request whose window and granularity need more buckets
    /// than the engine allows.
    #[error("window needs {buckets} volume buckets, limit is {limit}")]
    WindowTooLarge { buckets: u64, limit: u64 },

    #[error("internal computation failure: {0}")]
    Internal(String),
}

impl AnalyticsError {
    /// Stable machine-readable kind, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::InvalidWindow { .. } => "invalid_window",
            Self::UnsupportedDimension(_) => "unsupported_dimension",
            Self::WindowTooLarge { .. } => "window_too_large",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

pub type AnalyticsResult<T> = std::result::Result<T, AnalyticsError>;
