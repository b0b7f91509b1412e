//! Conversion pipeline: URL matching against the report listing, record building and artifact output.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use auditdash_core::{parse_report_field, slugify_with_max, OutputRecord, RawCell, RawRow, SummaryMap, DEFAULT_SLUG_MAX_LEN};
use auditdash_sources::{
    fetch_all_reports, read_recommendation_rows, read_summaries, title_match_key, InMemoryListing,
    PaginationConfig, RemoteReport, ReportListing, WpReportListing, DEFAULT_HEADER_ROW,
};
use auditdash_storage::{
    escape_non_ascii, render_script_assignment, write_atomic, BackoffPolicy, HttpClientConfig,
    HttpFetcher, StoredArtifact, UrlCache,
};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "auditdash-sync";

pub const DEFAULT_CONFIG_FILE: &str = "auditdash.yaml";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub xlsx_file: PathBuf,
    pub header_row: u32,
    pub cache_file: PathBuf,
    pub output_file: PathBuf,
    pub summaries_csv: PathBuf,
    pub summaries_file: PathBuf,
    pub data_var: String,
    pub summaries_var: String,
    pub api_url: String,
    pub listing_fixture: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub per_page: usize,
    pub rate_limit: Duration,
    pub max_attempts: usize,
    pub backoff_base: Duration,
    pub slug_max_len: usize,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            xlsx_file: PathBuf::from("projects/odca-dashboard/recommendations.xlsx"),
            header_row: DEFAULT_HEADER_ROW,
            cache_file: PathBuf::from("scripts/cache/odca_urls_cache.json"),
            output_file: PathBuf::from("projects/odca-dashboard/data.js"),
            summaries_csv: PathBuf::from("scripts/cache/report_summaries.csv"),
            summaries_file: PathBuf::from("projects/odca-dashboard/summaries.js"),
            data_var: "ODCA_DATA".to_string(),
            summaries_var: "REPORT_SUMMARIES".to_string(),
            api_url: "https://dcauditor.org/wp-json/wp/v2/report".to_string(),
            listing_fixture: None,
            user_agent: BROWSER_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            per_page: 100,
            rate_limit: Duration::from_secs(1),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            slug_max_len: DEFAULT_SLUG_MAX_LEN,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub xlsx_file: Option<PathBuf>,
    pub header_row: Option<u32>,
    pub cache_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub summaries_csv: Option<PathBuf>,
    pub summaries_file: Option<PathBuf>,
    pub data_var: Option<String>,
    pub summaries_var: Option<String>,
    pub api_url: Option<String>,
    pub listing_fixture: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub per_page: Option<usize>,
    pub rate_limit_ms: Option<u64>,
    pub max_attempts: Option<usize>,
    pub backoff_base_ms: Option<u64>,
    pub slug_max_len: Option<usize>,
}

impl ConvertConfig {
    /// An explicit `config_path` must exist; the default `auditdash.yaml` is optional.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if config_path.is_some() || path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: ConfigFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.apply_file(file);
            debug!(path = %path.display(), "applied config file");
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_file(&mut self, file: ConfigFile) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        set(&mut self.xlsx_file, file.xlsx_file);
        set(&mut self.header_row, file.header_row);
        set(&mut self.cache_file, file.cache_file);
        set(&mut self.output_file, file.output_file);
        set(&mut self.summaries_csv, file.summaries_csv);
        set(&mut self.summaries_file, file.summaries_file);
        set(&mut self.data_var, file.data_var);
        set(&mut self.summaries_var, file.summaries_var);
        set(&mut self.api_url, file.api_url);
        set(&mut self.user_agent, file.user_agent);
        set(&mut self.http_timeout_secs, file.http_timeout_secs);
        set(&mut self.per_page, file.per_page);
        set(&mut self.rate_limit, file.rate_limit_ms.map(Duration::from_millis));
        set(&mut self.max_attempts, file.max_attempts);
        set(&mut self.backoff_base, file.backoff_base_ms.map(Duration::from_millis));
        set(&mut self.slug_max_len, file.slug_max_len);
        if file.listing_fixture.is_some() {
            self.listing_fixture = file.listing_fixture;
        }
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        if let Some(v) = path("AUDITDASH_XLSX_FILE") {
            self.xlsx_file = v;
        }
        if let Some(v) = path("AUDITDASH_CACHE_FILE") {
            self.cache_file = v;
        }
        if let Some(v) = path("AUDITDASH_OUTPUT_FILE") {
            self.output_file = v;
        }
        if let Some(v) = path("AUDITDASH_SUMMARIES_CSV") {
            self.summaries_csv = v;
        }
        if let Some(v) = path("AUDITDASH_SUMMARIES_FILE") {
            self.summaries_file = v;
        }
        if let Some(v) = path("AUDITDASH_LISTING_FIXTURE") {
            self.listing_fixture = Some(v);
        }
        if let Some(v) = lookup("AUDITDASH_API_URL").filter(|v| !v.is_empty()) {
            self.api_url = v;
        }
        if let Some(v) = lookup("AUDITDASH_USER_AGENT").filter(|v| !v.is_empty()) {
            self.user_agent = v;
        }
        if let Some(v) = lookup("AUDITDASH_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_timeout_secs = v;
        }
        if let Some(v) = lookup("AUDITDASH_RATE_LIMIT_MS").and_then(|v| v.parse().ok()) {
            self.rate_limit = Duration::from_millis(v);
        }
    }

    pub fn pagination(&self) -> PaginationConfig {
        PaginationConfig {
            per_page: self.per_page,
            rate_limit: self.rate_limit,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            accept: Some("application/json".to_string()),
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts,
                base_delay: self.backoff_base,
                ..Default::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// URL matching

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrapeMode {
    Normal,
    NoScrape,
    CacheOnly,
}

impl ScrapeMode {
    pub fn allows_network(self) -> bool {
        matches!(self, ScrapeMode::Normal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchOutcome {
    Skipped,
    CacheMerged { fetched: usize, matched: usize },
}

impl MatchOutcome {
    pub fn cache_updated(&self) -> bool {
        matches!(self, MatchOutcome::CacheMerged { .. })
    }
}

// later entries win
pub fn build_match_index(reports: &[RemoteReport]) -> HashMap<String, String> {
    reports
        .iter()
        .map(|r| {
            (
                title_match_key(&r.title.rendered),
                r.link.trim_end_matches('/').to_string(),
            )
        })
        .collect()
}

pub fn match_titles(titles: &[String], reports: &[RemoteReport]) -> Vec<(String, Option<String>)> {
    let index = build_match_index(reports);
    titles
        .iter()
        .map(|title| {
            let url = index.get(&title_match_key(title)).cloned();
            match &url {
                Some(url) => debug!(title = %title, url = %url, "matched report url"),
                None => debug!(title = %title, "no report url"),
            }
            (title.clone(), url)
        })
        .collect()
}

pub struct UrlMatcher<'a> {
    listing: &'a dyn ReportListing,
    pagination: PaginationConfig,
}

impl<'a> UrlMatcher<'a> {
    pub fn new(listing: &'a dyn ReportListing, pagination: PaginationConfig) -> Self {
        Self {
            listing,
            pagination,
        }
    }

    /// Re-matches every title once any title is uncached. A miss never replaces a cached URL.
    pub async fn refresh(&self, titles: &[String], cache: &mut UrlCache) -> MatchOutcome {
        let uncached = cache.uncached(titles);
        if uncached.is_empty() {
            info!(titles = titles.len(), "all titles already cached");
            return MatchOutcome::Skipped;
        }

        info!(
            listing = self.listing.listing_id(),
            uncached = uncached.len(),
            "fetching report listing"
        );
        let reports = fetch_all_reports(self.listing, self.pagination).await;
        info!(total = reports.len(), "fetched remote reports");

        let matches = match_titles(titles, &reports);
        let matched = matches.iter().filter(|(_, url)| url.is_some()).count();
        cache.merge(matches);

        MatchOutcome::CacheMerged {
            fetched: reports.len(),
            matched,
        }
    }
}

// ---------------------------------------------------------------------------
// Records

pub fn unique_titles(rows: &[RawRow]) -> Vec<String> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|row| parse_report_field(Some(row.report_text().as_str())).title)
        .filter(|title| seen.insert(title.clone()))
        .collect()
}

fn rec_number(cell: &RawCell) -> i64 {
    if cell.is_falsy() {
        return 0;
    }
    cell.as_integer().unwrap_or_else(|| {
        warn!(value = %cell, "unparseable recommendation number; using 0");
        0
    })
}

/// Turn ordered rows into records with batch-unique ids.
///
/// Blank recommendation text is filled from the last row sharing the same raw
/// report field and recommendation number. Ids are `<slug>-<rec_no>`, with a
/// `-<n>` suffix on the n-th repeat of the same pair; the suffix keeps climbing
/// while the candidate is already taken by another report's id.
pub fn build_records(rows: &[RawRow], cache: &UrlCache, slug_max_len: usize) -> Vec<OutputRecord> {
    let mut records = Vec::with_capacity(rows.len());
    let mut id_counts: HashMap<String, usize> = HashMap::new();
    let mut emitted_ids: HashSet<String> = HashSet::new();
    let mut rec_text_by_key: HashMap<(String, i64), String> = HashMap::new();

    for row in rows {
        let report_raw = row.report_text();
        let rec_no = rec_number(&row.rec_no);

        let parsed = parse_report_field(Some(report_raw.as_str()));
        let Some(report_name) = parsed.title.filter(|t| !t.is_empty()) else {
            continue;
        };

        let report_slug = slugify_with_max(&report_name, slug_max_len);
        let report_url = cache.url_for(&report_name).map(ToString::to_string);

        // a whitespace-only cell stays "" unless an earlier row can fill it
        let key = (report_raw, rec_no);
        let mut recommendation = row.recommendation.to_text().map(|s| s.trim().to_string());
        match recommendation.as_deref() {
            Some(text) if !text.is_empty() => {
                rec_text_by_key.insert(key, text.to_string());
            }
            _ => {
                if let Some(fill) = rec_text_by_key.get(&key) {
                    recommendation = Some(fill.clone());
                }
            }
        }

        let base_id = format!("{report_slug}-{rec_no}");
        let count = id_counts.entry(base_id.clone()).or_default();
        *count += 1;
        let mut id = if *count == 1 {
            base_id.clone()
        } else {
            format!("{base_id}-{count}")
        };
        while !emitted_ids.insert(id.clone()) {
            *count += 1;
            id = format!("{base_id}-{count}");
        }

        records.push(OutputRecord {
            id,
            report_name,
            report_date: parsed.iso_date,
            report_date_raw: parsed.raw_date,
            report_url,
            rec_no,
            recommendation,
            agency: row.agency.trimmed_text().unwrap_or_default(),
            status: row.status.trimmed_text().unwrap_or_default(),
            notes: row.notes.trimmed_text(),
            report_slug,
        });
    }

    records
}

pub fn records_json(records: &[OutputRecord]) -> Result<String> {
    let json = serde_json::to_string_pretty(records).context("serializing records")?;
    Ok(escape_non_ascii(&json))
}

pub fn render_records_script(records: &[OutputRecord], var_name: &str, today: NaiveDate) -> Result<String> {
    let header = format!("Generated by auditdash - Last updated: {}", today.format("%Y-%m-%d"));
    Ok(render_script_assignment(Some(&header), var_name, &records_json(records)?))
}

// ---------------------------------------------------------------------------
// Summaries

pub fn merge_summaries(csv_path: &Path) -> Result<Option<SummaryMap>> {
    let summaries = read_summaries(csv_path)
        .with_context(|| format!("reading summaries {}", csv_path.display()))?;
    if summaries.is_none() {
        warn!(path = %csv_path.display(), "summaries csv not found; skipping summaries output");
    }
    Ok(summaries)
}

pub fn render_summaries_script(summaries: &SummaryMap, var_name: &str) -> Result<String> {
    let json = serde_json::to_string_pretty(summaries).context("serializing summaries")?;
    Ok(render_script_assignment(None, var_name, &json))
}

// ---------------------------------------------------------------------------
// Pipeline

#[derive(Debug, Clone, Serialize)]
pub struct ConvertSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: ScrapeMode,
    pub rows_read: usize,
    pub unique_reports: usize,
    pub urls_found: usize,
    pub match_outcome: MatchOutcome,
    pub records_written: usize,
    pub records_sha256: String,
    pub output_file: String,
    pub summaries_written: Option<usize>,
    pub summaries_file: Option<String>,
}

impl ConvertSummary {
    pub fn cache_updated(&self) -> bool {
        self.match_outcome.cache_updated()
    }
}

pub struct ConvertPipeline {
    config: ConvertConfig,
    listing: Box<dyn ReportListing>,
}

impl ConvertPipeline {
    pub fn new(config: ConvertConfig) -> Result<Self> {
        let listing: Box<dyn ReportListing> = match &config.listing_fixture {
            Some(path) => Box::new(
                InMemoryListing::from_json_file(path)
                    .with_context(|| format!("loading listing fixture {}", path.display()))?,
            ),
            None => {
                let http = HttpFetcher::new(config.http_client_config())?;
                Box::new(WpReportListing::new(http, config.api_url.clone()))
            }
        };
        Ok(Self { config, listing })
    }

    pub fn with_listing(mut self, listing: Box<dyn ReportListing>) -> Self {
        self.listing = listing;
        self
    }

    pub async fn run_once(&self, mode: ScrapeMode) -> Result<ConvertSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let config = &self.config;

        let mut cache = UrlCache::load(&config.cache_file).await;

        info!(path = %config.xlsx_file.display(), "reading recommendations workbook");
        let rows = read_recommendation_rows(&config.xlsx_file, config.header_row)
            .with_context(|| format!("reading workbook {}", config.xlsx_file.display()))?;
        let titles = unique_titles(&rows);
        info!(rows = rows.len(), unique_reports = titles.len(), "read workbook");

        let match_outcome = if mode.allows_network() {
            let matcher = UrlMatcher::new(self.listing.as_ref(), config.pagination());
            let outcome = matcher.refresh(&titles, &mut cache).await;
            if outcome.cache_updated() {
                cache.save(&config.cache_file).await?;
                info!(path = %config.cache_file.display(), entries = cache.len(), "url cache updated");
            }
            outcome
        } else {
            info!(?mode, "skipping url matching; using cache");
            MatchOutcome::Skipped
        };

        let urls_found = cache.found_count(&titles);
        info!(found = urls_found, total = titles.len(), "report urls resolved");

        let records = build_records(&rows, &cache, config.slug_max_len);
        let script = render_records_script(&records, &config.data_var, Local::now().date_naive())?;
        write_atomic(&config.output_file, script.as_bytes())
            .await
            .with_context(|| format!("writing {}", config.output_file.display()))?;
        info!(records = records.len(), path = %config.output_file.display(), "wrote records");

        let summaries = self.write_summaries().await?;

        Ok(ConvertSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            mode,
            rows_read: rows.len(),
            unique_reports: titles.len(),
            urls_found,
            match_outcome,
            records_written: records.len(),
            records_sha256: auditdash_storage::sha256_hex(records_json(&records)?.as_bytes()),
            output_file: config.output_file.display().to_string(),
            summaries_written: summaries.as_ref().map(|(count, _)| *count),
            summaries_file: summaries.map(|(_, artifact)| artifact.path.display().to_string()),
        })
    }

    pub async fn write_summaries(&self) -> Result<Option<(usize, StoredArtifact)>> {
        let config = &self.config;
        let Some(summaries) = merge_summaries(&config.summaries_csv)? else {
            return Ok(None);
        };
        let script = render_summaries_script(&summaries, &config.summaries_var)?;
        let artifact = write_atomic(&config.summaries_file, script.as_bytes())
            .await
            .with_context(|| format!("writing {}", config.summaries_file.display()))?;
        info!(entries = summaries.len(), path = %artifact.path.display(), "wrote summaries");
        Ok(Some((summaries.len(), artifact)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(report: &str, rec_no: Option<i64>, text: &str, agency: &str) -> RawRow {
        let text_cell = |s: &str| {
            if s.is_empty() {
                RawCell::Empty
            } else {
                RawCell::Text(s.to_string())
            }
        };
        RawRow {
            report: text_cell(report),
            rec_no: rec_no.map(RawCell::Int).unwrap_or_default(),
            recommendation: text_cell(text),
            agency: text_cell(agency),
            status: RawCell::Text("Open".into()),
            notes: RawCell::Empty,
        }
    }

    fn no_wait() -> PaginationConfig {
        PaginationConfig {
            per_page: 100,
            rate_limit: Duration::ZERO,
        }
    }

    #[test]
    fn forward_fill_is_scoped_to_report_and_rec_no() {
        let rows = vec![
            row("Audit K (1/2/23)", Some(1), "Do X", "A"),
            row("Audit K (1/2/23)", Some(1), "", "B"),
            row("Audit K (1/2/23)", Some(1), "", "C"),
            row("Audit K2 (1/2/23)", Some(1), "", "A"),
        ];
        let records = build_records(&rows, &UrlCache::new(), DEFAULT_SLUG_MAX_LEN);
        let texts = records
            .iter()
            .map(|r| r.recommendation.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec![Some("Do X"), Some("Do X"), Some("Do X"), None]);
    }

    #[test]
    fn forward_fill_does_not_cross_rec_numbers() {
        let rows = vec![
            row("Audit (1/2/23)", Some(1), "First", "A"),
            row("Audit (1/2/23)", Some(2), "", "A"),
        ];
        let records = build_records(&rows, &UrlCache::new(), DEFAULT_SLUG_MAX_LEN);
        assert_eq!(records[1].recommendation, None);
    }

    #[test]
    fn duplicate_ids_get_occurrence_suffix() {
        let rows = vec![
            row("Annual Audit (3/4/24)", Some(1), "Do X", "DCPS"),
            row("Annual Audit (3/4/24)", Some(1), "", "OSSE"),
            row("Annual Audit (3/4/24)", Some(2), "Do Y", "DCPS"),
            row("Annual Audit (3/4/24)", Some(1), "", "DOH"),
            row("Annual Audit (5/6/24)", Some(1), "Do Z", "DCPS"),
        ];
        let records = build_records(&rows, &UrlCache::new(), DEFAULT_SLUG_MAX_LEN);
        let ids = records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![
                "annual-audit-1",
                "annual-audit-1-2",
                "annual-audit-2",
                "annual-audit-1-3",
                "annual-audit-1-4",
            ]
        );
        let unique = ids.iter().collect::<std::collections::HashSet<_>>();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn suffixed_ids_never_collide_with_other_reports() {
        let rows = vec![
            row("A (1/1/23)", Some(1), "First", "X"),
            row("A (1/1/23)", Some(1), "", "Y"),
            row("A 1 (1/1/23)", Some(2), "Other", "X"),
            row("A (1/1/23)", Some(1), "", "Z"),
        ];
        let records = build_records(&rows, &UrlCache::new(), DEFAULT_SLUG_MAX_LEN);
        let ids = records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a-1", "a-1-2", "a-1-2-2", "a-1-3"]);
        let unique = ids.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn whitespace_recommendation_without_fill_is_empty_text() {
        let rows = vec![
            row("Audit (1/2/23)", Some(1), "   ", "A"),
            row("Audit (1/2/23)", Some(2), "Keep", "A"),
            row("Audit (1/2/23)", Some(2), "  ", "B"),
        ];
        let records = build_records(&rows, &UrlCache::new(), DEFAULT_SLUG_MAX_LEN);
        assert_eq!(records[0].recommendation.as_deref(), Some(""));
        assert_eq!(records[2].recommendation.as_deref(), Some("Keep"));
    }

    #[test]
    fn rows_without_titles_are_dropped_and_rec_no_defaults() {
        let rows = vec![
            row("", Some(3), "Orphan", "A"),
            row("No Date Here", None, "Track", "B"),
            RawRow {
                rec_no: RawCell::Text("n/a".into()),
                ..row("Other Report", None, "Check", "C")
            },
        ];
        let records = build_records(&rows, &UrlCache::new(), DEFAULT_SLUG_MAX_LEN);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "no-date-here-0");
        assert_eq!(records[0].rec_no, 0);
        assert_eq!(records[0].report_date, None);
        assert_eq!(records[1].rec_no, 0);
    }

    #[test]
    fn url_lookup_uses_exact_parsed_title() {
        let mut cache = UrlCache::new();
        cache.insert("Annual Audit", Some("https://example.org/annual-audit".to_string()));
        let rows = vec![
            row("Annual Audit (3/4/24)", Some(1), "Do X", "A"),
            row("annual audit (3/4/24)", Some(1), "Do X", "A"),
        ];
        let records = build_records(&rows, &cache, DEFAULT_SLUG_MAX_LEN);
        assert_eq!(records[0].report_url.as_deref(), Some("https://example.org/annual-audit"));
        assert_eq!(records[1].report_url, None);
        assert_eq!(records[0].report_slug, records[1].report_slug);
    }

    #[test]
    fn unique_titles_keep_first_seen_order() {
        let rows = vec![
            row("B Report (1/1/23)", Some(1), "x", "A"),
            row("A Report", Some(1), "x", "A"),
            row("B Report (1/1/23)", Some(2), "x", "A"),
            row("", Some(2), "x", "A"),
        ];
        assert_eq!(unique_titles(&rows), vec!["B Report".to_string(), "A Report".to_string()]);
    }

    #[test]
    fn match_strips_trailing_slash_and_normalizes_titles() {
        let reports = vec![
            RemoteReport::new("O&rsquo;Brien Report", "https://example.org/report/obrien/"),
            RemoteReport::new("Other", "https://example.org/report/other"),
        ];
        let matches = match_titles(&["obrien report".to_string(), "Missing".to_string()], &reports);
        assert_eq!(
            matches,
            vec![
                ("obrien report".to_string(), Some("https://example.org/report/obrien".to_string())),
                ("Missing".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn fully_cached_titles_skip_network() {
        let listing = InMemoryListing::new(vec![RemoteReport::new("A", "https://x/a")]);
        let mut cache = UrlCache::new();
        cache.insert("A", Some("https://x/a".to_string()));
        cache.insert("B", None);

        let outcome = UrlMatcher::new(&listing, no_wait())
            .refresh(&["A".to_string(), "B".to_string()], &mut cache)
            .await;
        assert_eq!(outcome, MatchOutcome::Skipped);
        assert!(!outcome.cache_updated());
        assert_eq!(listing.requests(), 0);
    }

    #[tokio::test]
    async fn uncached_title_triggers_fetch_and_merge() {
        let listing = InMemoryListing::new(vec![
            RemoteReport::new("Annual Audit", "https://x/annual/"),
            RemoteReport::new("Budget Review", "https://x/budget/"),
        ]);
        let mut cache = UrlCache::new();
        cache.insert("Budget Review", None);

        let titles = vec!["Budget Review".to_string(), "Annual Audit".to_string(), "Ghost".to_string()];
        let outcome = UrlMatcher::new(&listing, no_wait()).refresh(&titles, &mut cache).await;

        assert_eq!(outcome, MatchOutcome::CacheMerged { fetched: 2, matched: 2 });
        assert_eq!(listing.requests(), 1);
        assert_eq!(cache.url_for("Annual Audit"), Some("https://x/annual"));
        assert_eq!(cache.url_for("Budget Review"), Some("https://x/budget"));
        assert!(cache.contains("Ghost"));
        assert_eq!(cache.url_for("Ghost"), None);
    }

    #[tokio::test]
    async fn failed_listing_keeps_existing_matches() {
        let listing = InMemoryListing::new(Vec::new()).failing_from_page(1);
        let mut cache = UrlCache::new();
        cache.insert("Known", Some("https://x/known".to_string()));

        let titles = vec!["Known".to_string(), "New".to_string()];
        let outcome = UrlMatcher::new(&listing, no_wait()).refresh(&titles, &mut cache).await;

        assert_eq!(outcome, MatchOutcome::CacheMerged { fetched: 0, matched: 0 });
        assert_eq!(cache.url_for("Known"), Some("https://x/known"));
        assert!(cache.contains("New"));
    }

    #[test]
    fn records_script_escapes_and_frames() {
        let rows = vec![row("São Paulo Review (12/01/2023)", Some(1), "Translate", "MOLA")];
        let records = build_records(&rows, &UrlCache::new(), DEFAULT_SLUG_MAX_LEN);
        let date = NaiveDate::from_ymd_opt(2026, 2, 4).unwrap();
        let script = render_records_script(&records, "ODCA_DATA", date).unwrap();

        assert!(script.starts_with("// Generated by auditdash - Last updated: 2026-02-04\nconst ODCA_DATA = [\n"));
        assert!(script.ends_with("];\n"));
        assert!(script.contains(r#""report_name": "S\u00e3o Paulo Review""#));
        assert!(script.is_ascii());
        assert!(script.contains(r#""report_slug": "sao-paulo-review""#));
        assert!(script.contains(r#""report_date": "2023-12-01""#));
    }

    #[test]
    fn summaries_script_keeps_unicode() {
        let mut summaries = SummaryMap::new();
        summaries.insert("São Paulo Review".to_string(), "Language access".to_string());
        let script = render_summaries_script(&summaries, "REPORT_SUMMARIES").unwrap();
        assert_eq!(
            script,
            "const REPORT_SUMMARIES = {\n  \"São Paulo Review\": \"Language access\"\n};\n"
        );
    }

    #[test]
    fn config_layers_file_then_env() {
        let mut config = ConvertConfig::default();
        let file: ConfigFile = serde_yaml::from_str(
            "xlsx_file: data/recs.xlsx\nrate_limit_ms: 250\ndata_var: RECS\n",
        )
        .unwrap();
        config.apply_file(file);
        assert_eq!(config.xlsx_file, PathBuf::from("data/recs.xlsx"));
        assert_eq!(config.rate_limit, Duration::from_millis(250));
        assert_eq!(config.data_var, "RECS");

        config.apply_env(|key| match key {
            "AUDITDASH_XLSX_FILE" => Some("env/recs.xlsx".to_string()),
            "AUDITDASH_RATE_LIMIT_MS" => Some("0".to_string()),
            "AUDITDASH_HTTP_TIMEOUT_SECS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.xlsx_file, PathBuf::from("env/recs.xlsx"));
        assert_eq!(config.rate_limit, Duration::ZERO);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.cache_file, PathBuf::from("scripts/cache/odca_urls_cache.json"));
    }

    #[test]
    fn config_file_rejects_unknown_keys() {
        let parsed: Result<ConfigFile, _> = serde_yaml::from_str("xlsx: typo.xlsx\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn only_normal_mode_reaches_network() {
        assert!(ScrapeMode::Normal.allows_network());
        assert!(!ScrapeMode::NoScrape.allows_network());
        assert!(!ScrapeMode::CacheOnly.allows_network());
    }
}
