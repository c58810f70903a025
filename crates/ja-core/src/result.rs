//! # Aggregation Results

use crate::request::{Dimension, Granularity, TimeWindow};
use serde::Serialize;

/// Key used for postings that lack (or have an unrecognized) value for the
/// aggregated attribute.
pub const UNKNOWN_BUCKET: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub key: String,
    pub value: u64,
}

impl Bucket {
    pub fn new(key: impl Into<String>, value: u64) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Descriptive statistics over converted salary anchors, in whole units of
/// the reference currency. Integer division, floored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SalarySummary {
    pub currency: String,
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: u64,
    pub median: u64,
}

impl SalarySummary {
    /// `None` for an empty sample.
    pub fn from_values(currency: &str, mut values: Vec<u64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_unstable();
        let n = values.len();
        let sum: u128 = values.iter().map(|v| *v as u128).sum();
        let median = if n % 2 == 1 {
            values[n / 2]
        } else {
            ((values[n / 2 - 1] as u128 + values[n / 2] as u128) / 2) as u64
        };
        Some(Self {
            currency: currency.to_string(),
            count: n as u64,
            min: values[0],
            max: values[n - 1],
            mean: (sum / n as u128) as u64,
            median,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    pub dimension: Dimension,
    pub window: TimeWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    pub buckets: Vec<Bucket>,
    /// Postings in the filtered window that were successfully normalized.
    pub total_count: u64,
    /// Raw records dropped by normalization while computing this result.
    pub skipped_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_summary: Option<SalarySummary>,
}

impl AggregationResult {
    pub fn bucket(&self, key: &str) -> Option<&Bucket> {
        self.buckets.iter().find(|b| b.key == key)
    }

    pub fn bucket_sum(&self) -> u64 {
        self.buckets.iter().map(|b| b.value).sum()
    }
}
