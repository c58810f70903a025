//! # Job Posting
//!
//! The normalized, immutable record every aggregation works on. Raw source
//! records are turned into [`JobPosting`]s by the store adapter; nothing
//! downstream ever sees source-specific field names.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// Seniority
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Seniority {
    Intern,
    Junior,
    Mid,
    Senior,
    Lead,
    Unknown,
}

impl Seniority {
    /// Every level, in bucket order.
    pub const ALL: [Seniority; 6] = [
        Seniority::Intern,
        Seniority::Junior,
        Seniority::Mid,
        Seniority::Senior,
        Seniority::Lead,
        Seniority::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intern => "intern",
            Self::Junior => "junior",
            Self::Mid => "mid",
            Self::Senior => "senior",
            Self::Lead => "lead",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient mapping used during normalization: anything unrecognized is
    /// [`Seniority::Unknown`].
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for Seniority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Seniority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "intern" | "internship" | "trainee" => Ok(Self::Intern),
            "junior" | "jr" => Ok(Self::Junior),
            "mid" | "middle" | "regular" => Ok(Self::Mid),
            "senior" | "sr" => Ok(Self::Senior),
            "lead" | "principal" | "staff" => Ok(Self::Lead),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown seniority level '{}'", other)),
        }
    }
}

// =============================================================================
// Salary
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SalaryRangeError {
    #[error("salary range has neither a minimum nor a maximum")]
    Empty,
    #[error("salary minimum {min} exceeds maximum {max}")]
    Inverted { min: u64, max: u64 },
    #[error("salary bound present without a currency")]
    MissingCurrency,
}

/// Salary bounds in whole units of `currency`.
///
/// Invariants: at least one bound is present, `min <= max` when both are,
/// and the currency code is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSalaryRange")]
pub struct SalaryRange {
    min: Option<u64>,
    max: Option<u64>,
    currency: String,
}

#[derive(Deserialize)]
struct RawSalaryRange {
    min: Option<u64>,
    max: Option<u64>,
    #[serde(default)]
    currency: String,
}

impl TryFrom<RawSalaryRange> for SalaryRange {
    type Error = SalaryRangeError;

    fn try_from(raw: RawSalaryRange) -> Result<Self, Self::Error> {
        SalaryRange::new(raw.min, raw.max, raw.currency)
    }
}

impl SalaryRange {
    pub fn new(
        min: Option<u64>,
        max: Option<u64>,
        currency: impl Into<String>,
    ) -> Result<Self, SalaryRangeError> {
        let currency = normalize_currency(&currency.into());
        match (min, max) {
            (None, None) => return Err(SalaryRangeError::Empty),
            (Some(lo), Some(hi)) if lo > hi => {
                return Err(SalaryRangeError::Inverted { min: lo, max: hi })
            }
            _ => {}
        }
        if currency.is_empty() {
            return Err(SalaryRangeError::MissingCurrency);
        }
        Ok(Self { min, max, currency })
    }

    pub fn min(&self) -> Option<u64> {
        self.min
    }

    pub fn max(&self) -> Option<u64> {
        self.max
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// The amount used for bucketing: the minimum, or the maximum when the
    /// posting only advertises an upper bound.
    pub fn anchor(&self) -> u64 {
        // Construction guarantees at least one bound.
        self.min.or(self.max).unwrap_or_default()
    }
}

// =============================================================================
// Posting
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: String,
    pub title: String,
    /// Lower-cased, trimmed employer name.
    pub company: String,
    /// Upper-cased region/country code; `None` when missing or unrecognized.
    pub location: Option<String>,
    pub salary: Option<SalaryRange>,
    pub seniority: Seniority,
    pub skills: BTreeSet<String>,
    pub posted_at: DateTime<Utc>,
    pub source: String,
}

impl JobPosting {
    pub fn new(id: impl Into<String>, posted_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            company: String::new(),
            location: None,
            salary: None,
            seniority: Seniority::Unknown,
            skills: BTreeSet::new(),
            posted_at,
            source: String::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_company(mut self, company: &str) -> Self {
        self.company = normalize_company(company);
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = normalize_location(location);
        self
    }

    pub fn with_salary(mut self, salary: SalaryRange) -> Self {
        self.salary = Some(salary);
        self
    }

    pub fn with_seniority(mut self, seniority: Seniority) -> Self {
        self.seniority = seniority;
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.skills = skills
            .into_iter()
            .filter_map(|s| normalize_skill(s.as_ref()))
            .collect();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Calendar day (UTC) the posting was published on.
    pub fn posted_on(&self) -> NaiveDate {
        self.posted_at.date_naive()
    }
}

// =============================================================================
// Normalization helpers
// =============================================================================

pub fn normalize_company(raw: &str) -> String {
    collapse_whitespace(raw).to_lowercase()
}

/// Skill tags are case-folded and whitespace-collapsed. Synonyms are kept
/// distinct ("js" and "javascript" are different tags).
pub fn normalize_skill(raw: &str) -> Option<String> {
    let skill = collapse_whitespace(raw).to_lowercase();
    (!skill.is_empty()).then_some(skill)
}

pub fn normalize_location(raw: &str) -> Option<String> {
    let code = collapse_whitespace(raw).to_uppercase();
    if code.is_empty() || code == "UNKNOWN" {
        None
    } else {
        Some(code)
    }
}

/// ISO code, upper-cased. `RUR` is the legacy code some boards still emit.
pub fn normalize_currency(raw: &str) -> String {
    let code = raw.trim().to_uppercase();
    if code == "RUR" {
        "RUB".to_string()
    } else {
        code
    }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
