//! # ja-core — Job Analytics domain and engine
//!
//! The normalized [`JobPosting`] model, the typed [`AggregationRequest`] /
//! [`AggregationResult`] pair, and the pure aggregation engine that maps
//! one to the other. Nothing in this crate performs I/O or keeps state
//! between calls; caching and storage live in `ja-hub` and `ja-store`.

pub mod currency;
pub mod engine;
pub mod error;
pub mod posting;
pub mod request;
pub mod result;

pub use currency::{CurrencyError, CurrencyTable, Rate};
pub use engine::{aggregate, Aggregator, EngineConfig, SalaryBins};
pub use error::{AnalyticsError, AnalyticsResult};
pub use posting::{JobPosting, SalaryRange, SalaryRangeError, Seniority};
pub use request::{AggregationRequest, CacheKey, Dimension, FilterSet, Granularity, TimeWindow};
pub use result::{AggregationResult, Bucket, SalarySummary, UNKNOWN_BUCKET};
