//! Input sources: the recommendations workbook, the summaries CSV and the remote report listing.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use auditdash_core::{RawCell, RawRow, SummaryMap};
use auditdash_storage::{FetchError, HttpFetcher};
use calamine::{open_workbook_auto, Data, DataType, Range, Reader};
use chrono::NaiveDateTime;
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "auditdash-sources";

/// 1-based row holding the column headers; data starts on the next row.
pub const DEFAULT_HEADER_ROW: u32 = 4;

pub const MATCH_KEY_MAX_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("opening workbook {path}: {source}")]
    Workbook {
        path: String,
        #[source]
        source: calamine::Error,
    },
    #[error("workbook {0} has no worksheets")]
    NoWorksheet(String),
    #[error("summaries csv {path} has no `{column}` column")]
    MissingColumn { path: String, column: &'static str },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid listing payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Workbook rows

pub fn read_recommendation_rows(
    path: impl AsRef<Path>,
    header_row: u32,
) -> Result<Vec<RawRow>, SourceError> {
    let path = path.as_ref();
    let path_label = path.display().to_string();
    let mut workbook = open_workbook_auto(path).map_err(|source| SourceError::Workbook {
        path: path_label.clone(),
        source,
    })?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| SourceError::NoWorksheet(path_label.clone()))?
        .map_err(|source| SourceError::Workbook {
            path: path_label.clone(),
            source,
        })?;

    let rows = rows_from_range(&range, header_row);
    debug!(path = %path_label, rows = rows.len(), "read workbook rows");
    Ok(rows)
}

/// Data rows below the 1-based `header_row`. Rows whose every cell is falsy are skipped.
pub fn rows_from_range(range: &Range<Data>, header_row: u32) -> Vec<RawRow> {
    let (Some(_), Some((last_row, last_col))) = (range.start(), range.end()) else {
        return Vec::new();
    };

    let mut rows = Vec::new();
    for row in header_row..=last_row {
        let cells = (0..=last_col)
            .map(|col| range.get_value((row, col)).map(cell_from_data).unwrap_or_default())
            .collect::<Vec<_>>();
        if cells.iter().all(RawCell::is_falsy) {
            continue;
        }
        rows.push(RawRow::from_cells(cells));
    }
    rows
}

fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn cell_from_data(data: &Data) -> RawCell {
    match data {
        Data::Empty | Data::Error(_) => RawCell::Empty,
        Data::String(s) => RawCell::Text(s.clone()),
        Data::Int(n) => RawCell::Int(*n),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => RawCell::Int(*f as i64),
        Data::Float(f) => RawCell::Float(*f),
        Data::Bool(b) => RawCell::Bool(*b),
        Data::DateTime(_) => data
            .as_datetime()
            .map(|dt| RawCell::Text(format_datetime(dt)))
            .unwrap_or(RawCell::Empty),
        Data::DateTimeIso(s) | Data::DurationIso(s) => RawCell::Text(s.clone()),
    }
}

// ---------------------------------------------------------------------------
// Summaries CSV

/// Title -> summary rows with a non-empty summary. `Ok(None)` when the file does not exist.
pub fn read_summaries(path: impl AsRef<Path>) -> Result<Option<SummaryMap>, SourceError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let path_label = path.display().to_string();

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &'static str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| SourceError::MissingColumn {
                path: path_label.clone(),
                column: name,
            })
    };
    let name_idx = column("report_name")?;
    let summary_idx = column("summary")?;

    let mut summaries = SummaryMap::new();
    for record in reader.records() {
        let record = record?;
        let Some(summary) = record.get(summary_idx).filter(|s| !s.is_empty()) else {
            continue;
        };
        let Some(name) = record.get(name_idx) else {
            continue;
        };
        summaries.insert(name.to_string(), summary.to_string());
    }
    Ok(Some(summaries))
}

// ---------------------------------------------------------------------------
// Remote report listing

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedText {
    #[serde(default)]
    pub rendered: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReport {
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub title: RenderedText,
    #[serde(default)]
    pub link: String,
}

impl RemoteReport {
    pub fn new(title_html: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            slug: None,
            title: RenderedText {
                rendered: title_html.into(),
            },
            link: link.into(),
        }
    }
}

#[async_trait]
pub trait ReportListing: Send + Sync {
    fn listing_id(&self) -> &str;

    async fn fetch_page(&self, page: u32, per_page: usize) -> Result<Vec<RemoteReport>, SourceError>;
}

/// WordPress REST collection endpoint (`/wp-json/wp/v2/<type>`).
#[derive(Debug)]
pub struct WpReportListing {
    http: HttpFetcher,
    api_url: String,
}

impl WpReportListing {
    pub fn new(http: HttpFetcher, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }

    pub fn page_url(&self, page: u32, per_page: usize) -> String {
        let sep = if self.api_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{sep}per_page={per_page}&page={page}&_fields=slug,title,link",
            self.api_url
        )
    }
}

#[async_trait]
impl ReportListing for WpReportListing {
    fn listing_id(&self) -> &str {
        &self.api_url
    }

    async fn fetch_page(&self, page: u32, per_page: usize) -> Result<Vec<RemoteReport>, SourceError> {
        let url = self.page_url(page, per_page);
        let resp = self.http.fetch_bytes(&url).await?;
        Ok(serde_json::from_slice(&resp.body)?)
    }
}

/// Listing served from memory, paged the way the remote endpoint pages.
#[derive(Debug, Default)]
pub struct InMemoryListing {
    reports: Vec<RemoteReport>,
    fail_from_page: Option<u32>,
    requests: AtomicUsize,
}

impl InMemoryListing {
    pub fn new(reports: Vec<RemoteReport>) -> Self {
        Self {
            reports,
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(serde_json::from_str(&text)?))
    }

    pub fn failing_from_page(mut self, page: u32) -> Self {
        self.fail_from_page = Some(page);
        self
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportListing for InMemoryListing {
    fn listing_id(&self) -> &str {
        "in-memory"
    }

    async fn fetch_page(&self, page: u32, per_page: usize) -> Result<Vec<RemoteReport>, SourceError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_from_page.is_some_and(|p| page >= p) {
            return Err(SourceError::Fetch(FetchError::HttpStatus {
                status: 503,
                url: format!("in-memory?page={page}"),
            }));
        }
        let start = (page.max(1) as usize - 1).saturating_mul(per_page);
        Ok(self
            .reports
            .iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationConfig {
    pub per_page: usize,
    pub rate_limit: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            per_page: 100,
            rate_limit: Duration::from_secs(1),
        }
    }
}

/// Page through the listing until a short or empty page.
///
/// A page that still fails after the fetcher's retries ends pagination; whatever
/// was collected before it is returned.
pub async fn fetch_all_reports(
    listing: &dyn ReportListing,
    config: PaginationConfig,
) -> Vec<RemoteReport> {
    let per_page = config.per_page.max(1);
    let mut all = Vec::new();
    let mut page = 1u32;
    loop {
        let data = match listing.fetch_page(page, per_page).await {
            Ok(data) => data,
            Err(err) => {
                warn!(listing = listing.listing_id(), page, error = %err, "listing page failed; stopping pagination");
                break;
            }
        };
        if data.is_empty() {
            break;
        }
        let count = data.len();
        all.extend(data);
        info!(page, count, "fetched listing page");
        if count < per_page {
            break;
        }
        page += 1;
        tokio::time::sleep(config.rate_limit).await;
    }
    all
}

/// Matching key for report titles: entity-decoded, lowercased, ASCII alphanumerics only, 50 chars max.
///
/// Only entities are decoded. Angle brackets stay literal text, so a plain
/// `<FY2025>` and an escaped `&lt;FY2025&gt;` produce the same key.
pub fn title_match_key(title: &str) -> String {
    let decoded = Html::parse_fragment(&title.replace('<', "&lt;"))
        .root_element()
        .text()
        .collect::<String>();
    decoded
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .take(MATCH_KEY_MAX_LEN)
        .collect()
}
