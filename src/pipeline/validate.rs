//! Response validation: raw model text → [`StructuredRecord`].
//!
//! Models asked for "ONLY valid JSON" still wrap it in commentary ("Sure,
//! here you go: …") or code fences often enough that a strict parse alone
//! would waste attempts. Validation therefore runs in two stages:
//!
//! 1. **Extract**: strict-parse the whole text; failing that, strict-parse
//!    the first balanced `{…}` region. Braces inside string literals are
//!    skipped by tracking quote and escape state.
//! 2. **Enforce**: the closed schema `{page_content, tags, date?}` plus the
//!    per-field rules below. A record is built only when every rule holds.
//!
//! Both stages report failure as a value ([`ValidationFailure`]); the worker
//! retries it exactly like a failed remote call.

use crate::record::StructuredRecord;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Why a model response was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ValidationFailure {
    /// No JSON object could be recovered from the text.
    Unparsable,
    /// A JSON object was found but breaks the record schema.
    Schema(String),
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::Unparsable => write!(f, "unparsable response"),
            ValidationFailure::Schema(detail) => write!(f, "schema violation: {detail}"),
        }
    }
}

impl std::error::Error for ValidationFailure {}

/// Validate raw model output into a [`StructuredRecord`].
pub fn validate(raw_text: &str) -> Result<StructuredRecord, ValidationFailure> {
    let value = extract_json(raw_text).ok_or(ValidationFailure::Unparsable)?;
    enforce_schema(value).map_err(ValidationFailure::Schema)
}

// ── Stage 1: extraction ──────────────────────────────────────────────────

fn extract_json(raw_text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw_text) {
        return Some(value);
    }
    let region = find_json_object(raw_text)?;
    serde_json::from_str::<Value>(region).ok()
}

/// Return the balanced `{…}` region that opens at the first `{` in `text`.
///
/// Quote state flips on every unescaped `"`; a backslash inside a string
/// escapes exactly the next character. Returns `None` when the region never
/// closes.
pub fn find_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Stage 2: schema ──────────────────────────────────────────────────────

/// Wire shape of the model's answer. Unknown keys are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecord {
    page_content: String,
    tags: Vec<String>,
    #[serde(default)]
    date: Option<String>,
}

fn enforce_schema(value: Value) -> Result<StructuredRecord, String> {
    if !value.is_object() {
        return Err(format!("expected a JSON object, got {}", json_kind(&value)));
    }
    let raw: RawRecord = serde_json::from_value(value).map_err(|e| e.to_string())?;

    if is_blank(&raw.page_content) {
        return Err("page_content must be a non-empty string".into());
    }
    if raw.tags.is_empty() {
        return Err("tags must be a non-empty list".into());
    }
    if let Some(i) = raw.tags.iter().position(|t| is_blank(t)) {
        return Err(format!("tags[{i}] is empty"));
    }
    let date = match raw.date {
        Some(d) => normalize_date(&d)?,
        None => None,
    };

    Ok(StructuredRecord {
        page_content: raw.page_content,
        tags: raw.tags,
        date,
    })
}

/// Zero-width and formatting characters a model may emit that render as
/// nothing. The report tidy-up strips the same set.
pub const INVISIBLE_CHARS: [char; 6] = [
    '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
];

/// Empty once whitespace and [`INVISIBLE_CHARS`] are ignored.
fn is_blank(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_whitespace() || INVISIBLE_CHARS.contains(&c))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Dates ────────────────────────────────────────────────────────────────

/// Tokens a model uses to say "this page has no date". Compared upper-cased.
const NO_DATE_SENTINELS: &[&str] = &["NONE", "N/A", "NA", "NULL", "[ILLEGIBLE]", "UNREADABLE"];

/// Textual month-name formats, tried in order after the numeric shapes.
const TEXTUAL_FORMATS: &[&str] = &[
    "%d %b %Y",
    "%d %B %Y",
    "%Y %b %d",
    "%Y %B %d",
    "%B %d, %Y",
    "%b %d, %Y",
];

/// `D-M-Y` with one- or two-digit day/month and two- or four-digit year.
static RE_DAY_FIRST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})[-/.](\d{1,2})[-/.](\d{4}|\d{2})$").unwrap());

/// `YYYY-M-D`.
static RE_YEAR_FIRST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})$").unwrap());

/// Normalize a model-supplied date to canonical `DD-MM-YYYY`.
///
/// * `Ok(None)`: empty or a no-date sentinel.
/// * `Ok(Some(_))`: a real calendar date in a supported shape.
/// * `Err(_)`: anything else, including impossible dates like `31-02-2022`.
///
/// Canonical input comes back unchanged.
pub fn normalize_date(raw: &str) -> Result<Option<String>, String> {
    let s = raw.trim();
    if s.is_empty() || NO_DATE_SENTINELS.contains(&s.to_uppercase().as_str()) {
        return Ok(None);
    }

    if let Some(caps) = RE_DAY_FIRST.captures(s) {
        let year = expand_year(&caps[3]);
        return calendar_date(year, &caps[2], &caps[1], s).map(Some);
    }
    if let Some(caps) = RE_YEAR_FIRST.captures(s) {
        let year = caps[1].parse::<i32>().unwrap_or_default();
        return calendar_date(year, &caps[2], &caps[3], s).map(Some);
    }
    for fmt in TEXTUAL_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(Some(canonical(date)));
        }
    }

    Err(format!(
        "date '{s}' must be DD-MM-YYYY, YYYY-MM-DD, a textual date, or a no-date token"
    ))
}

/// Two-digit years are read as 20YY.
fn expand_year(digits: &str) -> i32 {
    let year = digits.parse::<i32>().unwrap_or_default();
    if digits.len() == 2 {
        2000 + year
    } else {
        year
    }
}

fn calendar_date(year: i32, month: &str, day: &str, original: &str) -> Result<String, String> {
    let month = month.parse::<u32>().unwrap_or_default();
    let day = day.parse::<u32>().unwrap_or_default();
    NaiveDate::from_ymd_opt(year, month, day)
        .map(canonical)
        .ok_or_else(|| format!("date '{original}' is not a real calendar date"))
}

fn canonical(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invisible_only_fields_are_blank() {
        assert!(is_blank(" \u{200B}\n\u{FEFF} "));
        assert!(!is_blank("\u{200B}a"));
        let err = validate("{\"page_content\":\"\u{200B}\",\"tags\":[\"x\"]}").unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
        let err = validate("{\"page_content\":\"a\",\"tags\":[\"\u{2060}\"]}").unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn strict_json_passes() {
        let rec = validate(r##"{"page_content":"# Notes","tags":["a","b"]}"##).unwrap();
        assert_eq!(rec.page_content, "# Notes");
        assert_eq!(rec.tags, vec!["a", "b"]);
        assert_eq!(rec.date, None);
    }

    #[test]
    fn embedded_json_with_commentary() {
        let raw = r#"Sure, here you go: {"page_content":"Hello","tags":["greeting"],"date":"5-2-22"}"#;
        let rec = validate(raw).unwrap();
        assert_eq!(rec.page_content, "Hello");
        assert_eq!(rec.tags, vec!["greeting"]);
        assert_eq!(rec.date.as_deref(), Some("05-02-2022"));
    }

    #[test]
    fn fenced_json_is_recovered() {
        let raw = "```json\n{\"page_content\":\"x\",\"tags\":[\"t\"]}\n```";
        assert!(validate(raw).is_ok());
    }

    #[test]
    fn empty_page_content_is_schema_failure() {
        let err = validate(r#"{"page_content":"","tags":["x"]}"#).unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn blank_tag_is_schema_failure() {
        let err = validate(r#"{"page_content":"p","tags":["ok","   "]}"#).unwrap_err();
        assert_eq!(err, ValidationFailure::Schema("tags[1] is empty".into()));
    }

    #[test]
    fn empty_tags_is_schema_failure() {
        let err = validate(r#"{"page_content":"p","tags":[]}"#).unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn non_string_tag_is_schema_failure() {
        let err = validate(r#"{"page_content":"p","tags":["a", 3]}"#).unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err =
            validate(r#"{"page_content":"p","tags":["a"],"confidence":0.9}"#).unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn missing_tags_is_rejected() {
        let err = validate(r#"{"page_content":"p"}"#).unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn top_level_non_object_is_schema_failure() {
        let err = validate(r#"["page_content"]"#).unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn no_braces_is_unparsable() {
        assert_eq!(
            validate("I could not read this page.").unwrap_err(),
            ValidationFailure::Unparsable
        );
    }

    #[test]
    fn unbalanced_region_is_unparsable() {
        assert_eq!(
            validate(r#"here: {"page_content":"x","tags":["a"]"#).unwrap_err(),
            ValidationFailure::Unparsable
        );
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let raw = r#"note {"page_content":"set {a} and \"}\" done","tags":["math"]} trailing }"#;
        let region = find_json_object(raw).unwrap();
        assert!(region.ends_with(r#"["math"]}"#));
        let rec = validate(raw).unwrap();
        assert_eq!(rec.page_content, r#"set {a} and "}" done"#);
    }

    #[test]
    fn escaped_backslash_before_quote_closes_string() {
        let raw = r#"x {"page_content":"path C:\\","tags":["win"]} y"#;
        let rec = validate(raw).unwrap();
        assert_eq!(rec.page_content, r"path C:\");
    }

    #[test]
    fn null_date_is_absent() {
        let rec = validate(r#"{"page_content":"p","tags":["a"],"date":null}"#).unwrap();
        assert_eq!(rec.date, None);
    }

    #[test]
    fn sentinels_normalize_to_absent() {
        for token in ["NONE", "none", "N/A", "n/a", "NA", "Null", "[illegible]", "Unreadable", "  "] {
            assert_eq!(normalize_date(token), Ok(None), "token {token:?}");
        }
    }

    #[test]
    fn canonical_date_is_idempotent() {
        assert_eq!(normalize_date("05-02-2022"), Ok(Some("05-02-2022".into())));
        let once = normalize_date("2022/2/5").unwrap().unwrap();
        assert_eq!(normalize_date(&once), Ok(Some(once.clone())));
    }

    #[test]
    fn year_first_is_converted() {
        assert_eq!(normalize_date("2023-11-30"), Ok(Some("30-11-2023".into())));
    }

    #[test]
    fn slashes_and_short_years() {
        assert_eq!(normalize_date("05/02/2022"), Ok(Some("05-02-2022".into())));
        assert_eq!(normalize_date("1.12.99"), Ok(Some("01-12-2099".into())));
    }

    #[test]
    fn textual_months_are_converted() {
        assert_eq!(normalize_date("5 Feb 2022"), Ok(Some("05-02-2022".into())));
        assert_eq!(normalize_date("14 March 2021"), Ok(Some("14-03-2021".into())));
        assert_eq!(normalize_date("2020 Jan 09"), Ok(Some("09-01-2020".into())));
        assert_eq!(normalize_date("July 4, 1999"), Ok(Some("04-07-1999".into())));
    }

    #[test]
    fn impossible_and_garbage_dates_fail() {
        assert!(normalize_date("31-02-2022").is_err());
        assert!(normalize_date("sometime in spring").is_err());
        assert!(normalize_date("2022").is_err());
    }

    #[test]
    fn bad_date_fails_whole_record() {
        let err = validate(r#"{"page_content":"p","tags":["a"],"date":"yesterday"}"#).unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn failure_display() {
        assert_eq!(ValidationFailure::Unparsable.to_string(), "unparsable response");
        assert!(ValidationFailure::Schema("x".into())
            .to_string()
            .contains("schema violation"));
    }
}
