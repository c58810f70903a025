//! # Aggregation Engine
//!
//! Turns a sequence of [`JobPosting`]s into an [`AggregationResult`] for one
//! [`AggregationRequest`]. The engine is a pure function of its inputs:
//! the same postings, request and config always produce the same result.
//!
//! Work is incremental. An [`Aggregator`] is fed one posting at a time, so
//! callers holding an async stream never need to collect the whole dataset
//! first. [`aggregate`] is the one-shot convenience wrapper.
//!
//! Per-dimension rules:
//!
//! | Dimension | Bucket key | Ordering |
//! |-----------|------------|----------|
//! | salary | `"{lo}-{hi}"`, last bin `"{lo}+"`, plus `"unknown"` | ascending bins |
//! | skills | skill tag | count desc, tag asc, top-K |
//! | seniority | level | fixed enum order |
//! | geography | location code, plus `"unknown"` | count desc, code asc |
//! | volume | bucket start date `YYYY-MM-DD` | chronological, gap-free |

use crate::currency::CurrencyTable;
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::posting::{JobPosting, Seniority};
use crate::request::{AggregationRequest, Dimension, Granularity, TimeWindow};
use crate::result::{AggregationResult, Bucket, SalarySummary, UNKNOWN_BUCKET};
use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;

// =============================================================================
// Configuration
// =============================================================================

/// Fixed-width salary histogram layout, in reference-currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SalaryBins {
    pub bin_width: u64,
    pub bin_count: usize,
    /// Converted salaries below this floor are treated as unknown (e.g.
    /// hourly or per-shift pay quoted in a monthly dataset). 0 disables it.
    pub min_plausible: u64,
}

impl Default for SalaryBins {
    fn default() -> Self {
        Self {
            bin_width: 50_000,
            bin_count: 10,
            min_plausible: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    pub salary: SalaryBins,
    pub top_k: usize,
    /// Upper bound on volume buckets per request.
    pub max_buckets: u64,
    pub currency: CurrencyTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            salary: SalaryBins::default(),
            top_k: 20,
            max_buckets: 10_000,
            currency: CurrencyTable::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.salary.bin_width == 0 {
            return Err("salary bin width must be positive".into());
        }
        if self.salary.bin_count == 0 {
            return Err("salary bin count must be at least 1".into());
        }
        if self.top_k == 0 {
            return Err("skills top-k must be at least 1".into());
        }
        if self.max_buckets == 0 {
            return Err("volume bucket limit must be at least 1".into());
        }
        Ok(())
    }
}

// =============================================================================
// Aggregator
// =============================================================================

enum DimensionState {
    Salary {
        bins: Vec<u64>,
        unknown: u64,
        anchors: Vec<u64>,
    },
    Skills {
        counts: HashMap<String, u64>,
        untagged: u64,
    },
    Seniority {
        counts: [u64; Seniority::ALL.len()],
    },
    Geography {
        counts: HashMap<String, u64>,
        unknown: u64,
    },
    Volume {
        starts: Vec<NaiveDate>,
        counts: Vec<u64>,
    },
}

/// Incremental accumulator for a single request.
pub struct Aggregator<'c> {
    request: AggregationRequest,
    config: &'c EngineConfig,
    total: u64,
    state: DimensionState,
}

impl<'c> Aggregator<'c> {
    /// Validates and normalizes `request`; fails with `InvalidWindow`,
    /// `UnsupportedDimension` or `WindowTooLarge` before any posting is
    /// looked at.
    pub fn new(request: &AggregationRequest, config: &'c EngineConfig) -> AnalyticsResult<Self> {
        let request = request.normalized()?;
        config.validate().map_err(AnalyticsError::Internal)?;

        let state = match request.dimension {
            Dimension::Salary => DimensionState::Salary {
                bins: vec![0; config.salary.bin_count],
                unknown: 0,
                anchors: Vec::new(),
            },
            Dimension::Skills => DimensionState::Skills {
                counts: HashMap::new(),
                untagged: 0,
            },
            Dimension::Seniority => DimensionState::Seniority {
                counts: [0; Seniority::ALL.len()],
            },
            Dimension::Geography => DimensionState::Geography {
                counts: HashMap::new(),
                unknown: 0,
            },
            Dimension::Volume => {
                let granularity = request.granularity.unwrap_or(Granularity::Day);
                let buckets = bucket_count(&request.window, granularity);
                if buckets > config.max_buckets {
                    return Err(AnalyticsError::WindowTooLarge {
                        buckets,
                        limit: config.max_buckets,
                    });
                }
                let starts = bucket_starts(&request.window, granularity);
                let counts = vec![0; starts.len()];
                DimensionState::Volume { starts, counts }
            }
        };

        Ok(Self {
            request,
            config,
            total: 0,
            state,
        })
    }

    /// The normalized request this aggregator computes.
    pub fn request(&self) -> &AggregationRequest {
        &self.request
    }

    /// Count one posting. Postings outside the window or not matching the
    /// filters are ignored, so callers may over-fetch.
    pub fn push(&mut self, posting: &JobPosting) {
        if !self.request.window.contains(posting.posted_on())
            || !self.request.filters.matches(posting)
        {
            return;
        }
        self.total += 1;

        match &mut self.state {
            DimensionState::Salary {
                bins,
                unknown,
                anchors,
            } => {
                let salary = &self.config.salary;
                let converted = posting.salary.as_ref().and_then(|s| {
                    self.config.currency.convert(s.anchor(), s.currency())
                });
                match converted {
                    Some(amount) if amount >= salary.min_plausible => {
                        let idx = (amount / salary.bin_width).min(bins.len() as u64 - 1);
                        bins[idx as usize] += 1;
                        anchors.push(amount);
                    }
                    _ => *unknown += 1,
                }
            }
            DimensionState::Skills { counts, untagged } => {
                if posting.skills.is_empty() {
                    *untagged += 1;
                }
                for skill in &posting.skills {
                    *counts.entry(skill.clone()).or_insert(0) += 1;
                }
            }
            DimensionState::Seniority { counts } => {
                let idx = Seniority::ALL
                    .iter()
                    .position(|s| *s == posting.seniority)
                    .unwrap_or(Seniority::ALL.len() - 1);
                counts[idx] += 1;
            }
            DimensionState::Geography { counts, unknown } => match &posting.location {
                Some(code) => *counts.entry(code.clone()).or_insert(0) += 1,
                None => *unknown += 1,
            },
            DimensionState::Volume { starts, counts } => {
                let day = posting.posted_on();
                // Window membership was checked above, so there is always a
                // bucket starting at or before `day`.
                let idx = starts.partition_point(|s| *s <= day);
                if idx > 0 {
                    counts[idx - 1] += 1;
                }
            }
        }
    }

    pub fn finish(self) -> AggregationResult {
        let mut salary_summary = None;

        let buckets = match self.state {
            DimensionState::Salary {
                bins,
                unknown,
                anchors,
            } => {
                let width = self.config.salary.bin_width;
                let last = bins.len() - 1;
                salary_summary =
                    SalarySummary::from_values(self.config.currency.reference(), anchors);
                let mut out: Vec<Bucket> = bins
                    .into_iter()
                    .enumerate()
                    .map(|(i, count)| {
                        let lo = width.saturating_mul(i as u64);
                        let key = if i == last {
                            format!("{}+", lo)
                        } else {
                            format!("{}-{}", lo, lo.saturating_add(width))
                        };
                        Bucket::new(key, count)
                    })
                    .collect();
                out.push(Bucket::new(UNKNOWN_BUCKET, unknown));
                out
            }
            DimensionState::Skills { counts, untagged } => {
                let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                let mut out: Vec<Bucket> = ranked
                    .into_iter()
                    .take(self.config.top_k)
                    .map(|(k, v)| Bucket::new(k, v))
                    .collect();
                if untagged > 0 {
                    out.push(Bucket::new(UNKNOWN_BUCKET, untagged));
                }
                out
            }
            DimensionState::Seniority { counts } => Seniority::ALL
                .iter()
                .zip(counts)
                .map(|(level, count)| Bucket::new(level.as_str(), count))
                .collect(),
            DimensionState::Geography { counts, unknown } => {
                let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                let mut out: Vec<Bucket> =
                    ranked.into_iter().map(|(k, v)| Bucket::new(k, v)).collect();
                out.push(Bucket::new(UNKNOWN_BUCKET, unknown));
                out
            }
            DimensionState::Volume { starts, counts } => starts
                .into_iter()
                .zip(counts)
                .map(|(start, count)| Bucket::new(start.format("%Y-%m-%d").to_string(), count))
                .collect(),
        };

        AggregationResult {
            dimension: self.request.dimension,
            window: self.request.window,
            granularity: self.request.granularity,
            buckets,
            total_count: self.total,
            skipped_count: 0,
            salary_summary,
        }
    }
}

/// One-shot aggregation over an in-memory sequence.
pub fn aggregate<'p, I>(
    records: I,
    request: &AggregationRequest,
    config: &EngineConfig,
) -> AnalyticsResult<AggregationResult>
where
    I: IntoIterator<Item = &'p JobPosting>,
{
    let mut aggregator = Aggregator::new(request, config)?;
    for posting in records {
        aggregator.push(posting);
    }
    Ok(aggregator.finish())
}

// =============================================================================
// Time buckets
// =============================================================================

/// Start date of every bucket covering `window`, in order. Day and week
/// buckets are fixed-length; month buckets advance by calendar month from
/// `window.start`. The last bucket may extend past `window.end`; only
/// in-window postings are ever counted into it.
pub fn bucket_starts(window: &TimeWindow, granularity: Granularity) -> Vec<NaiveDate> {
    if window.is_empty() {
        return Vec::new();
    }
    match granularity {
        Granularity::Day | Granularity::Week => {
            let step = if granularity == Granularity::Day { 1 } else { 7 };
            let n = (window.days() + step - 1) / step;
            (0..n)
                .map(|i| window.start + Duration::days(i * step))
                .collect()
        }
        Granularity::Month => {
            let mut starts = Vec::new();
            let mut i = 0u32;
            while let Some(start) = window.start.checked_add_months(Months::new(i)) {
                if start >= window.end {
                    break;
                }
                starts.push(start);
                i += 1;
            }
            starts
        }
    }
}

/// Length of [`bucket_starts`] without building it.
pub fn bucket_count(window: &TimeWindow, granularity: Granularity) -> u64 {
    if window.is_empty() {
        return 0;
    }
    match granularity {
        Granularity::Day => window.days() as u64,
        Granularity::Week => (window.days() as u64).div_ceil(7),
        Granularity::Month => {
            let (start, end) = (window.start, window.end);
            let months = ((end.year() - start.year()) * 12 + end.month() as i32
                - start.month() as i32)
                .max(0) as u32;
            // `start + months` lands in the end month, so either it already
            // reaches `end` or exactly one more bucket is needed.
            match start.checked_add_months(Months::new(months)) {
                Some(last) if last >= end => months as u64,
                _ => months as u64 + 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Rate;
    use crate::posting::SalaryRange;
    use crate::request::FilterSet;
    use chrono::{DateTime, TimeZone, Utc};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn jan() -> TimeWindow {
        TimeWindow::new(day(2024, 1, 1), day(2024, 2, 1))
    }

    fn config() -> EngineConfig {
        EngineConfig {
            salary: SalaryBins {
                bin_width: 100,
                bin_count: 3,
                min_plausible: 0,
            },
            top_k: 2,
            max_buckets: 400,
            currency: CurrencyTable::new("USD").with_rate("EUR", Rate::parse("2").unwrap()),
        }
    }

    fn salaried(id: &str, min: Option<u64>, max: Option<u64>, currency: &str) -> JobPosting {
        JobPosting::new(id, at(2024, 1, 10)).with_salary(SalaryRange::new(min, max, currency).unwrap())
    }

    #[test]
    fn test_salary_bins_use_minimum_and_edges_go_up() {
        let postings = vec![
            salaried("a", Some(99), Some(250), "USD"), // bin 0 despite spanning two bins
            salaried("b", Some(100), None, "USD"),     // exactly on the edge -> bin 1
            salaried("c", None, Some(150), "USD"),     // upper bound only -> bin 1
            salaried("d", Some(60), None, "EUR"),      // 120 USD -> bin 1
            salaried("e", Some(10_000), None, "USD"),  // overflow -> last bin
            salaried("f", Some(5), None, "GBP"),       // unconvertible -> unknown
            JobPosting::new("g", at(2024, 1, 3)),      // no salary -> unknown
        ];
        let req = AggregationRequest::new(Dimension::Salary, jan());
        let result = aggregate(&postings, &req, &config()).unwrap();

        let keys: Vec<&str> = result.buckets.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["0-100", "100-200", "200+", "unknown"]);
        assert_eq!(result.bucket("0-100").unwrap().value, 1);
        assert_eq!(result.bucket("100-200").unwrap().value, 3);
        assert_eq!(result.bucket("200+").unwrap().value, 1);
        assert_eq!(result.bucket("unknown").unwrap().value, 2);
        assert_eq!(result.total_count, 7);
        assert_eq!(result.bucket_sum(), result.total_count);

        let summary = result.salary_summary.unwrap();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.min, 99);
        assert_eq!(summary.max, 10_000);
        assert_eq!(summary.currency, "USD");
    }

    #[test]
    fn test_salary_below_plausible_floor_is_unknown() {
        let mut cfg = config();
        cfg.salary.min_plausible = 50;
        let postings = vec![salaried("a", Some(10), None, "USD"), salaried("b", Some(60), None, "USD")];
        let req = AggregationRequest::new(Dimension::Salary, jan());
        let result = aggregate(&postings, &req, &cfg).unwrap();
        assert_eq!(result.bucket("unknown").unwrap().value, 1);
        assert_eq!(result.bucket("0-100").unwrap().value, 1);
    }

    #[test]
    fn test_skill_ties_break_lexicographically() {
        let mut postings = Vec::new();
        for i in 0..3 {
            postings.push(JobPosting::new(format!("r{i}"), at(2024, 1, 2)).with_skills(["rust"]));
            postings.push(JobPosting::new(format!("g{i}"), at(2024, 1, 2)).with_skills(["go"]));
        }
        postings.push(JobPosting::new("p", at(2024, 1, 2)).with_skills(["python"]));
        postings.push(JobPosting::new("none", at(2024, 1, 2)));

        let req = AggregationRequest::new(Dimension::Skills, jan());
        let result = aggregate(&postings, &req, &config()).unwrap();
        let keys: Vec<&str> = result.buckets.iter().map(|b| b.key.as_str()).collect();
        // top_k = 2 drops python; untagged posting is reported separately
        assert_eq!(keys, vec!["go", "rust", "unknown"]);
        assert_eq!(result.buckets[0].value, 3);
        assert_eq!(result.total_count, 8);
    }

    #[test]
    fn test_seniority_emits_every_level() {
        let postings = vec![
            JobPosting::new("1", at(2024, 1, 2)).with_seniority(Seniority::Senior),
            JobPosting::new("2", at(2024, 1, 2)).with_seniority(Seniority::Senior),
            JobPosting::new("3", at(2024, 1, 2)),
        ];
        let req = AggregationRequest::new(Dimension::Seniority, jan());
        let result = aggregate(&postings, &req, &config()).unwrap();
        assert_eq!(result.buckets.len(), 6);
        assert_eq!(result.bucket("senior").unwrap().value, 2);
        assert_eq!(result.bucket("unknown").unwrap().value, 1);
        assert_eq!(result.bucket("intern").unwrap().value, 0);
        assert_eq!(result.bucket_sum(), result.total_count);
    }

    #[test]
    fn test_geography_orders_by_count_then_code() {
        let postings = vec![
            JobPosting::new("1", at(2024, 1, 2)).with_location("US"),
            JobPosting::new("2", at(2024, 1, 2)).with_location("DE"),
            JobPosting::new("3", at(2024, 1, 2)).with_location("DE"),
            JobPosting::new("4", at(2024, 1, 2)).with_location("AT"),
            JobPosting::new("5", at(2024, 1, 2)),
        ];
        let req = AggregationRequest::new(Dimension::Geography, jan());
        let result = aggregate(&postings, &req, &config()).unwrap();
        let keys: Vec<&str> = result.buckets.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["DE", "AT", "US", "unknown"]);
        assert_eq!(result.bucket_sum(), result.total_count);
    }

    #[test]
    fn test_volume_has_no_gaps() {
        let postings = vec![
            JobPosting::new("1", at(2024, 1, 1)),
            JobPosting::new("2", at(2024, 1, 1)),
            JobPosting::new("3", at(2024, 1, 9)),
            JobPosting::new("4", at(2024, 2, 1)), // end is exclusive
        ];
        let req = AggregationRequest::new(Dimension::Volume, jan()).with_granularity(Granularity::Week);
        let result = aggregate(&postings, &req, &config()).unwrap();
        // 31 days / 7 -> 5 buckets
        assert_eq!(result.buckets.len(), 5);
        let values: Vec<u64> = result.buckets.iter().map(|b| b.value).collect();
        assert_eq!(values, vec![2, 1, 0, 0, 0]);
        assert_eq!(result.buckets[1].key, "2024-01-08");
        assert_eq!(result.total_count, 3);
        assert_eq!(result.bucket_sum(), result.total_count);
    }

    #[test]
    fn test_volume_bucket_counts_match_ceil() {
        let w = TimeWindow::new(day(2024, 1, 1), day(2024, 1, 11));
        assert_eq!(bucket_starts(&w, Granularity::Day).len(), 10);
        assert_eq!(bucket_starts(&w, Granularity::Week).len(), 2);
        assert_eq!(bucket_starts(&w, Granularity::Month).len(), 1);

        let year = TimeWindow::new(day(2024, 1, 31), day(2025, 1, 31));
        let months = bucket_starts(&year, Granularity::Month);
        assert_eq!(months.len(), 12);
        assert_eq!(months[1], day(2024, 2, 29));
        assert_eq!(months[2], day(2024, 3, 31));

        let empty = TimeWindow::new(day(2024, 1, 1), day(2024, 1, 1));
        assert!(bucket_starts(&empty, Granularity::Day).is_empty());
    }

    #[test]
    fn test_bucket_count_matches_bucket_starts() {
        let windows = [
            TimeWindow::new(day(2024, 1, 1), day(2024, 1, 11)),
            TimeWindow::new(day(2024, 1, 31), day(2025, 1, 31)),
            TimeWindow::new(day(2024, 1, 31), day(2024, 3, 30)),
            TimeWindow::new(day(2024, 1, 15), day(2024, 3, 15)),
            TimeWindow::new(day(2023, 11, 20), day(2024, 2, 3)),
            TimeWindow::new(day(2024, 1, 1), day(2024, 1, 1)),
        ];
        for w in windows {
            for g in [Granularity::Day, Granularity::Week, Granularity::Month] {
                assert_eq!(
                    bucket_count(&w, g),
                    bucket_starts(&w, g).len() as u64,
                    "{:?} {:?}",
                    w,
                    g
                );
            }
        }
    }

    #[test]
    fn test_oversized_volume_window_is_rejected() {
        let decade = TimeWindow::new(day(2014, 1, 1), day(2024, 1, 1));
        let daily = AggregationRequest::new(Dimension::Volume, decade);
        let err = aggregate(std::iter::empty(), &daily, &config()).unwrap_err();
        assert_eq!(
            err,
            AnalyticsError::WindowTooLarge {
                buckets: 3652,
                limit: 400
            }
        );

        let monthly = daily.with_granularity(Granularity::Month);
        let result = aggregate(std::iter::empty(), &monthly, &config()).unwrap();
        assert_eq!(result.buckets.len(), 120);

        // The limit only concerns volume.
        let skills = AggregationRequest::new(Dimension::Skills, decade);
        assert!(aggregate(std::iter::empty(), &skills, &config()).is_ok());
    }

    #[test]
    fn test_daily_volume_keys() {
        let w = TimeWindow::new(day(2024, 1, 30), day(2024, 2, 2));
        let req = AggregationRequest::new(Dimension::Volume, w);
        let result = aggregate(&[JobPosting::new("x", at(2024, 2, 1))], &req, &config()).unwrap();
        let keys: Vec<&str> = result.buckets.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["2024-01-30", "2024-01-31", "2024-02-01"]);
        assert_eq!(result.buckets[2].value, 1);
    }

    #[test]
    fn test_invalid_window_for_every_dimension() {
        let inverted = TimeWindow::new(day(2024, 3, 1), day(2024, 1, 1));
        for dim in Dimension::ALL {
            let req = AggregationRequest::new(dim, inverted);
            let err = aggregate(std::iter::empty(), &req, &config()).unwrap_err();
            assert!(matches!(err, AnalyticsError::InvalidWindow { .. }), "{dim}");
        }
    }

    #[test]
    fn test_filters_and_window_apply_in_engine() {
        let postings = vec![
            JobPosting::new("1", at(2024, 1, 2)).with_company("Acme"),
            JobPosting::new("2", at(2024, 1, 2)).with_company("Other"),
            JobPosting::new("3", at(2023, 12, 31)).with_company("Acme"),
        ];
        let req = AggregationRequest::new(Dimension::Seniority, jan()).with_filters(FilterSet {
            company: Some("ACME".into()),
            ..Default::default()
        });
        let result = aggregate(&postings, &req, &config()).unwrap();
        assert_eq!(result.total_count, 1);
    }

    #[test]
    fn test_aggregate_is_deterministic() {
        let postings: Vec<JobPosting> = (0..50)
            .map(|i| {
                JobPosting::new(format!("{i}"), at(2024, 1, 1 + (i % 28) as u32))
                    .with_skills([format!("s{}", i % 7)])
                    .with_location(if i % 3 == 0 { "RU" } else { "KZ" })
            })
            .collect();
        for dim in Dimension::ALL {
            let req = AggregationRequest::new(dim, jan());
            let a = aggregate(&postings, &req, &config()).unwrap();
            let b = aggregate(postings.iter().rev(), &req, &config()).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_invalid_config_is_internal_error() {
        let mut cfg = config();
        cfg.salary.bin_width = 0;
        let req = AggregationRequest::new(Dimension::Salary, jan());
        assert!(matches!(
            aggregate(std::iter::empty(), &req, &cfg),
            Err(AnalyticsError::Internal(_))
        ));
    }
}
