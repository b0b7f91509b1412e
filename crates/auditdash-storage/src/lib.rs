//! URL cache persistence, generated-artifact writes and HTTP fetch utilities for auditdash.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "auditdash-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes through a temp file in the target directory, then rename over the destination.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))
    }
    .await;
    drop(file);
    discard_temp_on_error(&temp_path, written).await?;

    let renamed = fs::rename(&temp_path, path).await.with_context(|| {
        format!(
            "renaming temp file {} -> {}",
            temp_path.display(),
            path.display()
        )
    });
    discard_temp_on_error(&temp_path, renamed).await?;

    Ok(StoredArtifact {
        path: path.to_path_buf(),
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

async fn discard_temp_on_error<T>(temp_path: &Path, result: anyhow::Result<T>) -> anyhow::Result<T> {
    if result.is_err() {
        let _ = fs::remove_file(temp_path).await;
    }
    result
}

/// Replace every non-ASCII character in serialized JSON with `\uXXXX` escapes.
///
/// serde_json only emits non-ASCII inside string literals, so a plain character
/// scan is enough. Astral characters become UTF-16 surrogate pairs.
pub fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut units = [0u16; 2];
    for ch in json.chars() {
        if ch.is_ascii() {
            out.push(ch);
            continue;
        }
        for unit in ch.encode_utf16(&mut units) {
            let _ = write!(out, "\\u{unit:04x}");
        }
    }
    out
}

/// `const <NAME> = <json>;` with an optional leading comment line.
pub fn render_script_assignment(header_comment: Option<&str>, var_name: &str, json: &str) -> String {
    let mut out = String::with_capacity(json.len() + var_name.len() + 64);
    if let Some(comment) = header_comment {
        let _ = writeln!(out, "// {comment}");
    }
    let _ = writeln!(out, "const {var_name} = {json};");
    out
}

/// Persistent report title -> URL mapping.
///
/// A title present with a `null` URL was looked up before and did not match.
/// Presence alone counts as cached, so such titles are never queried again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UrlCache {
    entries: IndexMap<String, Option<String>>,
}

impl UrlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cache file; a missing, unreadable or corrupt file yields an empty cache.
    pub async fn load(path: &Path) -> Self {
        match fs::try_exists(path).await {
            Ok(true) => {}
            Ok(false) => return Self::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not check url cache; starting empty");
                return Self::default();
            }
        }

        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read url cache; starting empty");
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not parse url cache; starting empty");
                Self::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<StoredArtifact> {
        let json = serde_json::to_string_pretty(&self.entries).context("serializing url cache")?;
        write_atomic(path, escape_non_ascii(&json).as_bytes())
            .await
            .with_context(|| format!("writing url cache {}", path.display()))
    }

    pub fn contains(&self, title: &str) -> bool {
        self.entries.contains_key(title)
    }

    /// Matched URL for a title; `None` both when uncached and when cached as unmatched.
    pub fn url_for(&self, title: &str) -> Option<&str> {
        self.entries.get(title).and_then(|url| url.as_deref())
    }

    /// Existing titles keep their position; new titles are appended.
    pub fn insert(&mut self, title: impl Into<String>, url: Option<String>) {
        self.entries.insert(title.into(), url);
    }

    /// Merge match results. A miss records the title but never replaces a cached URL.
    pub fn merge(&mut self, matches: impl IntoIterator<Item = (String, Option<String>)>) {
        for (title, url) in matches {
            if url.is_none() && self.url_for(&title).is_some() {
                continue;
            }
            self.insert(title, url);
        }
    }

    pub fn uncached<'a>(&self, titles: &'a [String]) -> Vec<&'a str> {
        titles
            .iter()
            .filter(|t| !self.contains(t))
            .map(String::as_str)
            .collect()
    }

    pub fn found_count(&self, titles: &[String]) -> usize {
        titles.iter().filter(|t| self.url_for(t).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Sleep after the zero-based failed attempt: `base * 2^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            accept: Some("application/json".to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("failed after {attempts} attempts: {url}")]
    Exhausted {
        attempts: usize,
        url: String,
        #[source]
        last: Box<FetchError>,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(accept) = &config.accept {
            headers.insert(
                ACCEPT,
                HeaderValue::from_str(accept).context("invalid Accept header value")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET with bounded retries. Any non-200 status or transport error is a failed attempt.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let attempts = self.backoff.max_attempts.max(1);
        let span = info_span!("http_fetch", url);

        async move {
            let mut last_error = None;
            for attempt in 0..attempts {
                match self.try_once(url).await {
                    Ok(resp) => return Ok(resp),
                    Err(err) => {
                        warn!(attempt = attempt + 1, error = %err, "fetch attempt failed");
                        last_error = Some(err);
                    }
                }
                if attempt + 1 < attempts {
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                }
            }

            Err(FetchError::Exhausted {
                attempts,
                url: url.to_string(),
                last: Box::new(last_error.unwrap_or_else(|| FetchError::HttpStatus {
                    status: 0,
                    url: url.to_string(),
                })),
            })
        }
        .instrument(span)
        .await
    }

    async fn try_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
