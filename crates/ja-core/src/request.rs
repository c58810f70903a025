//! # Aggregation Requests
//!
//! Strongly typed description of one analytics computation: which dimension,
//! which time window, which filters and (for volume) which granularity.
//! Requests are normalized before they are hashed, so that two requests
//! asking the same question always map to the same cache key.

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::posting::{normalize_company, normalize_location, normalize_skill, JobPosting, Seniority};
use crate::result::UNKNOWN_BUCKET;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Dimension / Granularity
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Salary,
    Skills,
    Volume,
    Seniority,
    Geography,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Salary,
        Dimension::Skills,
        Dimension::Volume,
        Dimension::Seniority,
        Dimension::Geography,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Salary => "salary",
            Self::Skills => "skills",
            Self::Volume => "volume",
            Self::Seniority => "seniority",
            Self::Geography => "geography",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "salary" => Ok(Self::Salary),
            "skills" => Ok(Self::Skills),
            "volume" => Ok(Self::Volume),
            "seniority" => Ok(Self::Seniority),
            "geography" => Ok(Self::Geography),
            other => Err(AnalyticsError::UnsupportedDimension(other.to_string())),
        }
    }
}

/// Time-bucket width for the volume dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            other => Err(AnalyticsError::UnsupportedDimension(format!(
                "granularity '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// Time window
// =============================================================================

/// Half-open date range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> AnalyticsResult<()> {
        if self.start > self.end {
            return Err(AnalyticsError::InvalidWindow {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day < self.end
    }

    /// Number of calendar days covered (0 for an empty window).
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days().max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Optional constraints on posting attributes. All present constraints must
/// hold for a posting to be counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    /// `unknown` selects postings without a location, the same postings
    /// the geography dimension counts under its `unknown` bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seniority: Option<Seniority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Case-insensitive substring of the title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Every listed skill must be present on the posting.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub skills: BTreeSet<String>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Canonical representation: same normalization as the posting fields,
    /// empty strings dropped.
    pub fn normalized(&self) -> Self {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            company: non_empty(&self.company)
                .map(|c| normalize_company(&c))
                .filter(|c| !c.is_empty()),
            location: non_empty(&self.location)
                .map(|l| normalize_location(&l).unwrap_or_else(|| UNKNOWN_BUCKET.to_string())),
            seniority: self.seniority,
            source: non_empty(&self.source),
            title: non_empty(&self.title).map(|t| t.to_lowercase()),
            skills: self
                .skills
                .iter()
                .filter_map(|s| normalize_skill(s))
                .collect(),
        }
    }

    /// Expects `self` to be normalized.
    pub fn matches(&self, posting: &JobPosting) -> bool {
        if let Some(company) = &self.company {
            if &posting.company != company {
                return false;
            }
        }
        if let Some(location) = &self.location {
            let hit = if location == UNKNOWN_BUCKET {
                posting.location.is_none()
            } else {
                posting.location.as_ref() == Some(location)
            };
            if !hit {
                return false;
            }
        }
        if let Some(seniority) = self.seniority {
            if posting.seniority != seniority {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &posting.source != source {
                return false;
            }
        }
        if let Some(title) = &self.title {
            if !posting.title.to_lowercase().contains(title.as_str()) {
                return false;
            }
        }
        self.skills.is_subset(&posting.skills)
    }
}

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationRequest {
    pub dimension: Dimension,
    pub window: TimeWindow,
    #[serde(default)]
    pub filters: FilterSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
}

/// Hex SHA-256 of a normalized request's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AggregationRequest {
    pub fn new(dimension: Dimension, window: TimeWindow) -> Self {
        Self {
            dimension,
            window,
            filters: FilterSet::default(),
            granularity: None,
        }
    }

    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = Some(granularity);
        self
    }

    /// The window is checked first, so an inverted window is reported as
    /// `InvalidWindow` whatever else is wrong with the request.
    pub fn validate(&self) -> AnalyticsResult<()> {
        self.window.validate()?;
        if let Some(g) = self.granularity {
            if self.dimension != Dimension::Volume {
                return Err(AnalyticsError::UnsupportedDimension(format!(
                    "granularity '{}' is only valid for the volume dimension, not '{}'",
                    g, self.dimension
                )));
            }
        }
        Ok(())
    }

    /// Validate, fill the default granularity and canonicalize filters.
    pub fn normalized(&self) -> AnalyticsResult<Self> {
        self.validate()?;
        let granularity = match self.dimension {
            Dimension::Volume => Some(self.granularity.unwrap_or(Granularity::Day)),
            _ => None,
        };
        Ok(Self {
            dimension: self.dimension,
            window: self.window,
            filters: self.filters.normalized(),
            granularity,
        })
    }

    /// Deterministic textual form. Struct fields serialize in declaration
    /// order and skill sets are ordered, so equal requests produce equal
    /// strings.
    pub fn canonical_form(&self) -> AnalyticsResult<String> {
        serde_json::to_string(self).map_err(|e| AnalyticsError::Internal(e.to_string()))
    }

    /// Cache key of the normalized request.
    pub fn cache_key(&self) -> AnalyticsResult<CacheKey> {
        let canonical = self.normalized()?.canonical_form()?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(CacheKey(format!("{:x}", digest)))
    }
}
