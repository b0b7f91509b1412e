//! Core domain model, report field parsing and slug generation for auditdash.

use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "auditdash-core";

pub const DEFAULT_SLUG_MAX_LEN: usize = 60;

/// Report title -> free-text summary, kept in source order.
pub type SummaryMap = IndexMap<String, String>;

/// One spreadsheet cell after best-effort type coercion by the row reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum RawCell {
    #[default]
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl RawCell {
    /// Empty cells, blank strings, zeros and `false` all count as "no value".
    pub fn is_falsy(&self) -> bool {
        match self {
            RawCell::Empty => true,
            RawCell::Text(s) => s.is_empty(),
            RawCell::Int(n) => *n == 0,
            RawCell::Float(f) => *f == 0.0,
            RawCell::Bool(b) => !*b,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RawCell::Empty)
    }

    /// Rendered text for truthy cells, untrimmed.
    pub fn to_text(&self) -> Option<String> {
        if self.is_falsy() {
            None
        } else {
            Some(self.to_string())
        }
    }

    /// Trimmed text, or `None` when the cell is falsy or only whitespace.
    pub fn trimmed_text(&self) -> Option<String> {
        self.to_text().and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// Integer view of the cell. Floats truncate toward zero; text must hold an integer literal.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RawCell::Empty => None,
            RawCell::Int(n) => Some(*n),
            RawCell::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            RawCell::Float(_) => None,
            RawCell::Bool(b) => Some(i64::from(*b)),
            RawCell::Text(s) => s.trim().parse::<i64>().ok(),
        }
    }
}

impl fmt::Display for RawCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawCell::Empty => Ok(()),
            RawCell::Text(s) => f.write_str(s),
            RawCell::Int(n) => write!(f, "{n}"),
            RawCell::Float(v) => write!(f, "{v}"),
            RawCell::Bool(true) => f.write_str("True"),
            RawCell::Bool(false) => f.write_str("False"),
        }
    }
}

/// The six significant spreadsheet columns of one data row, in sheet order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRow {
    pub report: RawCell,
    pub rec_no: RawCell,
    pub recommendation: RawCell,
    pub agency: RawCell,
    pub status: RawCell,
    pub notes: RawCell,
}

impl RawRow {
    /// Builds a row from positional cells; missing trailing cells are empty.
    pub fn from_cells(cells: impl IntoIterator<Item = RawCell>) -> Self {
        let mut cells = cells.into_iter();
        let mut next = || cells.next().unwrap_or_default();
        Self {
            report: next(),
            rec_no: next(),
            recommendation: next(),
            agency: next(),
            status: next(),
            notes: next(),
        }
    }

    /// The report field as the record builder sees it: trimmed text or empty.
    pub fn report_text(&self) -> String {
        self.report
            .to_text()
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}

/// Result of splitting `"<title> (<M/D/Y>)"`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedReport {
    pub title: Option<String>,
    pub iso_date: Option<String>,
    pub raw_date: Option<String>,
}

/// One dashboard recommendation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub id: String,
    pub report_name: String,
    pub report_date: Option<String>,
    pub report_date_raw: Option<String>,
    pub report_url: Option<String>,
    pub rec_no: i64,
    pub recommendation: Option<String>,
    pub agency: String,
    pub status: String,
    #[serde(rename = "notes_2026")]
    pub notes: Option<String>,
    pub report_slug: String,
}

fn report_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+?)\s+\(([0-9]{1,2}/[0-9]{1,2}/[0-9]{2,4})\)\s*$")
            .expect("report field pattern is valid")
    })
}

/// Splits a report field into title, ISO date and the date exactly as written.
///
/// Two-digit years land in the 2000s. Month and day are not range checked, so
/// `13/40/24` yields `2024-13-40`. Input without a trailing parenthesized date
/// keeps the whole trimmed string as the title.
pub fn parse_report_field(raw: Option<&str>) -> ParsedReport {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return ParsedReport::default();
    };
    let raw = raw.trim();

    if let Some(caps) = report_field_regex().captures(raw) {
        let title = caps[1].trim().to_string();
        let raw_date = caps[2].to_string();
        let mut parts = raw_date.split('/').map(|p| p.parse::<u32>().unwrap_or(0));
        let month = parts.next().unwrap_or(0);
        let day = parts.next().unwrap_or(0);
        let mut year = parts.next().unwrap_or(0);
        if year < 100 {
            year += 2000;
        }
        return ParsedReport {
            title: Some(title),
            iso_date: Some(format!("{year:04}-{month:02}-{day:02}")),
            raw_date: Some(raw_date),
        };
    }

    ParsedReport {
        title: (!raw.is_empty()).then(|| raw.to_string()),
        iso_date: None,
        raw_date: None,
    }
}

/// URL-safe slug capped at [`DEFAULT_SLUG_MAX_LEN`] characters.
pub fn slugify(text: &str) -> String {
    slugify_with_max(text, DEFAULT_SLUG_MAX_LEN)
}

pub fn slugify_with_max(text: &str, max_len: usize) -> String {
    let ascii = text
        .nfkd()
        .filter(char::is_ascii)
        .collect::<String>()
        .to_ascii_lowercase();

    let mut slug = String::with_capacity(ascii.len());
    let mut in_separator = false;
    for ch in ascii.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            in_separator = false;
        } else if !in_separator {
            // punctuation turns into a space, then every space/underscore/hyphen run folds to one hyphen
            slug.push('-');
            in_separator = true;
        }
    }

    slug.trim_matches('-')
        .chars()
        .take(max_len)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}
