//! # Posting Normalization
//!
//! Maps raw JSON records onto [`JobPosting`]. Two shapes are understood:
//!
//! - the canonical schema (`id`, `title`, `company`, `location`,
//!   `salary: {min, max, currency}`, `seniority`, `skills`, `posted_at`,
//!   `source`);
//! - the hh.ru vacancy shape (`name`, `employer.name`, `area.name`,
//!   `salary: {from, to, currency}`, `experience.id`, `key_skills[].name`,
//!   `published_at`).
//!
//! Records missing an identifier, carrying a malformed salary, or with an
//! unparseable date fail with [`AnalyticsError::SchemaMismatch`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ja_core::{AnalyticsError, JobPosting, SalaryRange, Seniority};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Normalize one raw record. `default_source` is used when the record does
/// not name its own source.
pub fn normalize(raw: &Value, default_source: &str) -> Result<JobPosting, AnalyticsError> {
    let id = record_id(raw).ok_or_else(|| mismatch("<unknown>", "missing identifier"))?;

    let posted_at = match first_str(raw, &["/posted_at", "/published_at", "/posted_date"]) {
        Some(text) => parse_timestamp(text)
            .ok_or_else(|| mismatch(&id, format!("unparseable date '{}'", text)))?,
        None => return Err(mismatch(&id, "missing posted date")),
    };

    let title = first_str(raw, &["/title", "/name"]).unwrap_or_default().trim().to_string();
    let mut posting = JobPosting::new(id.clone(), posted_at)
        .with_title(title.clone())
        .with_source(
            first_str(raw, &["/source"])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(default_source),
        );

    if let Some(company) = first_str(raw, &["/company", "/employer/name"]) {
        posting = posting.with_company(company);
    }
    if let Some(location) = first_str(raw, &["/location", "/country_code", "/area/name"]) {
        posting = posting.with_location(location);
    }
    if let Some(salary) = parse_salary(raw.get("salary")).map_err(|reason| mismatch(&id, reason))? {
        posting = posting.with_salary(salary);
    }

    posting = posting
        .with_seniority(parse_seniority(raw, &title))
        .with_skills(parse_skills(raw));

    Ok(posting)
}

/// Best-effort posted date of a raw record, without full normalization.
pub fn raw_posted_on(raw: &Value) -> Option<NaiveDate> {
    first_str(raw, &["/posted_at", "/published_at", "/posted_date"])
        .and_then(parse_timestamp)
        .map(|ts| ts.date_naive())
}

fn mismatch(record: &str, reason: impl Into<String>) -> AnalyticsError {
    AnalyticsError::SchemaMismatch {
        record: record.to_string(),
        reason: reason.into(),
    }
}

fn record_id(raw: &Value) -> Option<String> {
    match raw.get("id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_str<'a>(raw: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .find_map(|p| raw.pointer(p).and_then(Value::as_str))
}

/// RFC 3339, the `+0300` offset form hh.ru emits, a naive timestamp
/// (taken as UTC) or a bare date (midnight UTC).
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Salary
// =============================================================================

/// `Ok(None)` for an absent or all-null salary; `Err` for a salary that is
/// present but malformed.
fn parse_salary(value: Option<&Value>) -> Result<Option<SalaryRange>, String> {
    let obj = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(obj)) => obj,
        Some(other) => return Err(format!("salary must be an object, got {}", other)),
    };

    let bound = |keys: [&str; 2]| -> Result<Option<u64>, String> {
        match keys.iter().find_map(|k| obj.get(*k)) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => parse_amount(v).map(Some),
        }
    };
    let min = bound(["min", "from"])?;
    let max = bound(["max", "to"])?;
    if min.is_none() && max.is_none() {
        return Ok(None);
    }

    let currency = obj.get("currency").and_then(Value::as_str).unwrap_or_default();
    SalaryRange::new(min, max, currency)
        .map(Some)
        .map_err(|e| e.to_string())
}

fn parse_amount(value: &Value) -> Result<u64, String> {
    let parsed = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
            digits.parse::<u64>().ok()
        }
        _ => None,
    };
    parsed.ok_or_else(|| format!("malformed salary amount {}", value))
}

// =============================================================================
// Seniority
// =============================================================================

fn parse_seniority(raw: &Value, title: &str) -> Seniority {
    if let Some(label) = raw.get("seniority").and_then(Value::as_str) {
        return Seniority::from_label(label);
    }
    if let Some(id) = raw.pointer("/experience/id").and_then(Value::as_str) {
        let mapped = experience_to_seniority(id);
        if mapped != Seniority::Unknown {
            return mapped;
        }
    }
    seniority_from_title(title)
}

fn experience_to_seniority(id: &str) -> Seniority {
    match id {
        "noExperience" => Seniority::Junior,
        "between1And3" => Seniority::Mid,
        "between3And6" => Seniority::Senior,
        "moreThan6" => Seniority::Lead,
        _ => Seniority::Unknown,
    }
}

struct TitlePatterns {
    rules: Vec<(Regex, Seniority)>,
}

fn title_patterns() -> &'static TitlePatterns {
    static PATTERNS: OnceLock<TitlePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Checked in order: "Senior Intern" is an intern.
        let rules = [
            (r"(?i)\b(intern|internship|trainee)\b|стажер|стажёр", Seniority::Intern),
            (r"(?i)\b(lead|head|principal|staff)\b|тимлид|руководител", Seniority::Lead),
            (r"(?i)\b(senior|sr)\b|старший|ведущий", Seniority::Senior),
            (r"(?i)\b(junior|jr)\b|младший", Seniority::Junior),
            (r"(?i)\b(middle|mid)\b", Seniority::Mid),
        ];
        TitlePatterns {
            rules: rules
                .into_iter()
                .map(|(pattern, level)| {
                    (Regex::new(pattern).expect("static seniority pattern"), level)
                })
                .collect(),
        }
    })
}

fn seniority_from_title(title: &str) -> Seniority {
    title_patterns()
        .rules
        .iter()
        .find(|(re, _)| re.is_match(title))
        .map(|(_, level)| *level)
        .unwrap_or(Seniority::Unknown)
}

// =============================================================================
// Skills
// =============================================================================

fn parse_skills(raw: &Value) -> Vec<String> {
    let list = raw
        .get("skills")
        .or_else(|| raw.get("key_skills"))
        .and_then(Value::as_array);
    let Some(list) = list else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect()
}
