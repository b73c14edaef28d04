//! Query classification and temporal phrase parsing.
//!
//! Classification is a pure function of the query text and the caller's
//! filters. An explicit `query_type` override always wins; an explicit date
//! range makes the query temporal. Otherwise lexical markers decide:
//!
//! | Markers present        | Result                                   |
//! |------------------------|------------------------------------------|
//! | temporal only          | `temporal`                               |
//! | advisory only          | `advisory`                               |
//! | both                   | `ClassificationAmbiguous` → `direct`     |
//! | neither                | `direct`                                 |
//!
//! Date parsing takes `today` as a parameter so relative phrases resolve
//! against a caller-chosen date.

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;
use std::sync::OnceLock;
use tracing::info;

use crate::error::{Result, SearchError};
use crate::models::{DateRange, QueryFilters, QueryType};

/// Outcome of classifying one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub query_type: QueryType,
    /// Date range for temporal queries: the caller's filter if given,
    /// otherwise the range parsed from the text.
    pub date_range: Option<DateRange>,
    /// The markers conflicted and the query fell back to `direct`.
    pub ambiguous: bool,
}

fn temporal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            \b(yesterday|today|tonight|recently|lately)\b
            | \b(this|last|past|previous)\s+(week|month)\b
            | \b(last|past)\s+\d+\s+(day|days|week|weeks)\b
            | \bsince\s+\d{4}-\d{2}-\d{2}\b
            | \b\d{4}-\d{2}-\d{2}\b",
        )
        .expect("static temporal regex is valid")
    })
}

fn advisory_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            \bshould\s+(i|we)\b
            | \brecommend(ation|ations|ed)?\b
            | \badvi(ce|se)\b
            | \bcompar(e|ed|ing|ison)\b
            | \bpros\s+and\s+cons\b
            | \btrade-?offs?\b
            | \bevaluat(e|ion)\b
            | \bsummari[sz]e\b
            | \bsummary\b
            | \bversus\b|\bvs\.?\s",
        )
        .expect("static advisory regex is valid")
    })
}

pub fn has_temporal_markers(text: &str) -> bool {
    temporal_re().is_match(&text.to_lowercase())
}

/// Evaluative wording, or a question in several parts.
pub fn has_advisory_markers(text: &str) -> bool {
    let lower = text.to_lowercase();
    advisory_re().is_match(&lower) || lower.matches('?').count() > 1
}

/// Classify from the text alone, reporting conflicting markers as an error.
pub fn classify_text(text: &str) -> Result<QueryType> {
    match (has_temporal_markers(text), has_advisory_markers(text)) {
        (true, true) => Err(SearchError::ClassificationAmbiguous(format!(
            "both temporal and advisory markers in '{}'",
            text
        ))),
        (true, false) => Ok(QueryType::Temporal),
        (false, true) => Ok(QueryType::Advisory),
        (false, false) => Ok(QueryType::Direct),
    }
}

/// Classify a query, resolving ambiguity to `direct`.
pub fn classify(
    text: &str,
    filters: &QueryFilters,
    today: NaiveDate,
    default_days: u32,
) -> Classification {
    let (query_type, ambiguous) = if let Some(forced) = filters.query_type {
        (forced, false)
    } else if filters.date_range.is_some() {
        (QueryType::Temporal, false)
    } else {
        match classify_text(text) {
            Ok(t) => (t, false),
            Err(e) => {
                info!(error = %e, "resolving ambiguous query to direct");
                (QueryType::Direct, true)
            }
        }
    };

    let date_range = match query_type {
        QueryType::Temporal => Some(filters.date_range.unwrap_or_else(|| {
            parse_date_range(text, today, default_days)
                .unwrap_or_else(|| default_window(today, default_days))
        })),
        _ => filters.date_range,
    };

    Classification {
        query_type,
        date_range,
        ambiguous,
    }
}

/// The last `days` days up to and including `today`.
pub fn default_window(today: NaiveDate, days: u32) -> DateRange {
    DateRange::new(today - Duration::days(i64::from(days)), today)
}

/// Resolve the first date expression in `text` against `today`.
///
/// Explicit dates take precedence over relative phrases. "last N days"
/// spans `[today - N, today]`.
pub fn parse_date_range(text: &str, today: NaiveDate, default_days: u32) -> Option<DateRange> {
    let lower = text.to_lowercase();

    static SINCE_RE: OnceLock<Regex> = OnceLock::new();
    let since = SINCE_RE.get_or_init(|| {
        Regex::new(r"\bsince\s+(\d{4}-\d{2}-\d{2})\b").expect("static since regex is valid")
    });
    if let Some(date) = since.captures(&lower).and_then(|c| parse_iso(&c[1])) {
        return Some(DateRange::new(date, today));
    }

    static ISO_RE: OnceLock<Regex> = OnceLock::new();
    let iso = ISO_RE
        .get_or_init(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("static iso regex is valid"));
    let dates: Vec<NaiveDate> = iso
        .find_iter(&lower)
        .filter_map(|m| parse_iso(m.as_str()))
        .collect();
    match dates.as_slice() {
        [] => {}
        [single] => return Some(DateRange::single(*single)),
        [first, .., last] => return Some(DateRange::new(*first, *last)),
    }

    static SPAN_RE: OnceLock<Regex> = OnceLock::new();
    let span = SPAN_RE.get_or_init(|| {
        Regex::new(r"\b(?:last|past)\s+(\d+)\s+(day|days|week|weeks)\b")
            .expect("static span regex is valid")
    });
    if let Some(caps) = span.captures(&lower) {
        let n: i64 = caps[1].parse().ok()?;
        let days = if caps[2].starts_with("week") { n * 7 } else { n };
        return Some(DateRange::new(today - Duration::days(days), today));
    }

    if contains_word(&lower, "yesterday") {
        return Some(DateRange::single(today - Duration::days(1)));
    }
    if contains_word(&lower, "today") || contains_word(&lower, "tonight") {
        return Some(DateRange::single(today));
    }

    let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    if lower.contains("this week") {
        return Some(DateRange::new(week_start, today));
    }
    if lower.contains("last week") || lower.contains("past week") || lower.contains("previous week")
    {
        let start = week_start - Duration::days(7);
        return Some(DateRange::new(start, start + Duration::days(6)));
    }

    let month_start = today.with_day(1)?;
    if lower.contains("this month") {
        return Some(DateRange::new(month_start, today));
    }
    if lower.contains("last month")
        || lower.contains("past month")
        || lower.contains("previous month")
    {
        let prev_end = month_start - Duration::days(1);
        return Some(DateRange::new(prev_end.with_day(1)?, prev_end));
    }

    if contains_word(&lower, "recently") || contains_word(&lower, "lately") {
        return Some(default_window(today, default_days));
    }
    None
}

fn parse_iso(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}
