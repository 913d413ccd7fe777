use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::schema::{CategorySet, FieldValue, TypeDescriptor};

/// Outcome of one deterministic parse attempt. Unrecognized input is
/// `NotApplicable` (escalate), never an error. These parsers are pure
/// and safe to run in bulk.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseAttempt {
    Parsed(FieldValue),
    /// The source explicitly marks the value as unavailable
    Na,
    NotApplicable,
}

static REGION_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([A-Z]{2,6})\)$").expect("region suffix regex"));

static DASH_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d[\d,]*\s*-\s*(\d[\d,]*)$").expect("dash range regex"));

/// Markers the filings use for a missing value.
pub fn is_na_value(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "" | "na" | "n/a" | "none" | "unknown" | "not available"
    )
}

/// Dispatch on the field's declared type.
pub fn parse_field(descriptor: &TypeDescriptor, raw: &str) -> ParseAttempt {
    if is_na_value(raw) {
        return ParseAttempt::Na;
    }
    match descriptor {
        TypeDescriptor::Count => parse_count(raw),
        TypeDescriptor::Date => parse_date(raw),
        TypeDescriptor::Time => parse_time(raw),
        TypeDescriptor::Timestamp => parse_timestamp(raw),
        TypeDescriptor::Category(set) => parse_category(*set, raw),
        TypeDescriptor::Text => ParseAttempt::Parsed(FieldValue::Text(raw.trim().to_string())),
    }
}

/// Integer magnitudes: thousands separators, an `Approx.` prefix, and
/// dash ranges (a range resolves to its highest value) are conventional
/// in the filings.
pub fn parse_count(raw: &str) -> ParseAttempt {
    let mut cleaned = raw.trim().to_string();
    for prefix in ["Approx.", "approx.", "Approximately", "approximately", "~"] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.trim().to_string();
        }
    }
    if let Some(caps) = DASH_RANGE.captures(&cleaned) {
        cleaned = caps[1].to_string();
    }
    cleaned.retain(|c| c != ',');
    match cleaned.parse::<u64>() {
        Ok(n) => ParseAttempt::Parsed(FieldValue::Count(n)),
        Err(_) => ParseAttempt::NotApplicable,
    }
}

/// Dates in the regional orders the filings actually use.
pub fn parse_date(raw: &str) -> ParseAttempt {
    let raw = raw.trim();
    let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%y"))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m-%d-%Y"));
    match parsed {
        Ok(d) => ParseAttempt::Parsed(FieldValue::Date(d)),
        Err(_) => ParseAttempt::NotApplicable,
    }
}

/// Clock times, including the `5:55 p.m.` style the older filings use.
pub fn parse_time(raw: &str) -> ParseAttempt {
    let raw = raw.trim();
    let canonical = raw
        .to_ascii_uppercase()
        .replace("A.M.", "AM")
        .replace("P.M.", "PM")
        .replace("A.M", "AM")
        .replace("P.M", "PM");
    let parsed = NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .or_else(|_| NaiveTime::parse_from_str(&canonical, "%I:%M %p"))
        .or_else(|_| NaiveTime::parse_from_str(&canonical, "%I %p"));
    match parsed {
        Ok(t) => ParseAttempt::Parsed(FieldValue::Time(t)),
        Err(_) => ParseAttempt::NotApplicable,
    }
}

/// Full timestamps only occur in already-clean inputs (ISO-like).
pub fn parse_timestamp(raw: &str) -> ParseAttempt {
    let raw = raw.trim();
    let parsed = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%m/%d/%Y %H:%M"));
    match parsed {
        Ok(ts) => ParseAttempt::Parsed(FieldValue::Timestamp(ts)),
        Err(_) => ParseAttempt::NotApplicable,
    }
}

/// Keyword groups that map disturbance prose onto one cause category.
/// Matching is deterministic only when exactly one group fires;
/// ambiguous prose escalates to interpretation.
const CAUSE_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "Weather",
        &[
            "weather", "storm", "storms", "thunderstorm", "hurricane", "tornado", "ice",
            "lightning", "wind", "winds", "snow", "blizzard", "heat",
        ],
    ),
    ("Fire", &["fire", "wildfire"]),
    ("Vandalism", &["vandalism", "vandals", "sabotage", "attack"]),
    ("Fuel Supply Deficiency", &["fuel"]),
    ("Load Shedding", &["load shed", "load shedding", "shed load", "interruptible"]),
    ("Equipment Failure", &["equipment", "transformer", "breaker", "cable", "relay", "failure"]),
    ("Operational Error", &["operator", "operational error", "human error"]),
    ("System Disturbance", &["voltage", "frequency", "islanding", "system disturbance", "separation"]),
    ("Public Appeal", &["appeal", "conservation", "curtailment", "curtailed"]),
];

/// Whole-word occurrence check. A keyword inside a longer word is not a
/// hit, so "service" never fires "ice" and "rewind" never fires "wind".
/// Multi-word keywords match as literal phrases with the same bounds.
fn contains_keyword(lower: &str, keyword: &str) -> bool {
    let bytes = lower.as_bytes();
    let mut start = 0;
    while let Some(pos) = lower[start..].find(keyword) {
        let begin = start + pos;
        let end = begin + keyword.len();
        let bounded_before = begin == 0 || !bytes[begin - 1].is_ascii_alphanumeric();
        let bounded_after = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if bounded_before && bounded_after {
            return true;
        }
        start = begin + 1;
    }
    false
}

pub fn parse_category(set: CategorySet, raw: &str) -> ParseAttempt {
    let trimmed = raw.trim();
    // Exact membership first, case-insensitively
    for allowed in set.values() {
        if allowed.eq_ignore_ascii_case(trimmed) {
            return ParseAttempt::Parsed(FieldValue::Category((*allowed).to_string()));
        }
    }
    match set {
        CategorySet::NercRegion => ParseAttempt::NotApplicable,
        CategorySet::Cause => {
            let lower = trimmed.to_ascii_lowercase();
            let mut hits = CAUSE_KEYWORDS
                .iter()
                .filter(|(_, keywords)| keywords.iter().any(|k| contains_keyword(&lower, k)))
                .map(|(category, _)| *category);
            match (hits.next(), hits.next()) {
                (Some(category), None) => {
                    ParseAttempt::Parsed(FieldValue::Category(category.to_string()))
                }
                _ => ParseAttempt::NotApplicable,
            }
        }
    }
}

/// Older filings append the NERC region to the utility name in
/// parentheses, e.g. `Pacific Gas & Electric (WSCC)`.
pub fn split_region_suffix(utility: &str) -> (String, Option<String>) {
    let trimmed = utility.trim();
    if let Some(caps) = REGION_SUFFIX.captures(trimmed) {
        let region = caps[1].to_string();
        let name = trimmed[..caps.get(0).expect("whole match").start()]
            .trim()
            .to_string();
        (name, Some(region))
    } else {
        (trimmed.to_string(), None)
    }
}
