//! Snapshot persistence + HTTP fetch utilities for flatwatch.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use flatwatch_core::Snapshot;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, ORIGIN, REFERER, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flatwatch-storage";

pub const SNIPPET_CHARS: usize = 300;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy)]
pub struct FlapPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for FlapPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            delay: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Hosts (and their subdomains) that get browser-like request headers.
    pub browser_hosts: Vec<String>,
    pub flap: FlapPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            browser_hosts: vec!["pik-service.ru".to_string(), "pik.ru".to_string()],
            flap: FlapPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn snippet(&self) -> String {
        snippet(&self.body, SNIPPET_CHARS)
    }
}

/// Why a response was judged to be the upstream serving something other than the requested page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlapReason {
    HtmlPage,
    EmptyBody,
    NonJsonBody,
    MultipleSegments(i64),
    SegmentMismatch,
}

impl fmt::Display for FlapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HtmlPage => f.write_str("html-page"),
            Self::EmptyBody => f.write_str("empty-body"),
            Self::NonJsonBody => f.write_str("non-json-body"),
            Self::MultipleSegments(n) => write!(f, "count-blocks={n}"),
            Self::SegmentMismatch => f.write_str("blocks-mismatch"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} (content-type {content_type:?}): {snippet}")]
    HttpStatus {
        status: u16,
        url: String,
        content_type: String,
        snippet: String,
    },
    #[error("reading response body from {url}: {source}")]
    BodyRead {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(
        "upstream flapped for {url} (segment {expected_segment}, {attempts} attempts, \
         reason {reason}, content-type {content_type:?}): {snippet}"
    )]
    Flap {
        url: String,
        expected_segment: i64,
        attempts: u32,
        reason: FlapReason,
        content_type: String,
        snippet: String,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    browser_hosts: Vec<String>,
    flap: FlapPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            browser_hosts: config.browser_hosts,
            flap: config.flap,
        })
    }

    pub fn wants_browser_headers(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.browser_hosts.iter().any(|suffix| {
            host == suffix
                || host
                    .strip_suffix(suffix.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Single GET. Non-2xx statuses and transport failures are returned as errors, never retried.
    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_fetch", url);
        self.get_inner(url).instrument(span).await
    }

    async fn get_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url);
        if self.wants_browser_headers(url) {
            request = request
                .header(USER_AGENT, BROWSER_USER_AGENT)
                .header(ACCEPT, "application/json, text/plain, */*")
                .header(ACCEPT_LANGUAGE, "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7")
                .header(REFERER, "https://www.pik.ru/")
                .header(ORIGIN, "https://www.pik.ru");
        }

        let resp = request.send().await.map_err(|source| FetchError::Network {
            url: url.to_string(),
            source,
        })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = resp
            .bytes()
            .await
            .map_err(|source| FetchError::BodyRead {
                url: final_url.clone(),
                source,
            })?
            .to_vec();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                content_type,
                snippet: snippet(&body, SNIPPET_CHARS),
            });
        }

        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }

    /// GET that re-issues the request while the response looks like a flap for `expected_segment`.
    pub async fn get_with_flap_retries(
        &self,
        url: &str,
        expected_segment: Option<i64>,
    ) -> Result<FetchedResponse, FetchError> {
        let expected = match expected_segment {
            Some(id) if id != 0 => id,
            _ => return self.get(url).await,
        };

        let max_attempts = self.flap.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let response = self.get(url).await?;
            let Some(reason) = detect_flap(&response, expected) else {
                if attempt > 1 {
                    debug!(url, attempt, "flap cleared");
                }
                return Ok(response);
            };

            if attempt >= max_attempts {
                warn!(url, attempt, %reason, "giving up on flapping upstream");
                return Err(FetchError::Flap {
                    url: url.to_string(),
                    expected_segment: expected,
                    attempts: attempt,
                    reason,
                    content_type: response.content_type.clone(),
                    snippet: response.snippet(),
                });
            }

            attempt += 1;
            tokio::time::sleep(self.flap.delay).await;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FlapProbe {
    #[serde(default)]
    data: Option<ProbeData>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeData {
    #[serde(default)]
    stats: Option<ProbeStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeStats {
    #[serde(default)]
    blocks: Option<Vec<i64>>,
    #[serde(default)]
    count_blocks: Option<i64>,
}

fn looks_like_html(response: &FetchedResponse, trimmed: &str) -> bool {
    if response.content_type.to_ascii_lowercase().contains("text/html") {
        return true;
    }
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('<') {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    lower.contains("<html") || lower.contains("<!doctype")
}

/// Returns the flap reason when `response` is not the JSON page for `expected_segment`.
///
/// JSON that fails to decode is not a flap; the page parser reports it instead.
pub fn detect_flap(response: &FetchedResponse, expected_segment: i64) -> Option<FlapReason> {
    if expected_segment == 0 {
        return None;
    }

    let text = String::from_utf8_lossy(&response.body);
    let trimmed = text.trim();
    if looks_like_html(response, trimmed) {
        return Some(FlapReason::HtmlPage);
    }
    if trimmed.is_empty() {
        return Some(FlapReason::EmptyBody);
    }
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return Some(FlapReason::NonJsonBody);
    }

    let probe: FlapProbe = serde_json::from_str(trimmed).ok()?;
    let stats = probe.data.and_then(|data| data.stats)?;
    if let Some(count) = stats.count_blocks.filter(|count| *count > 1) {
        return Some(FlapReason::MultipleSegments(count));
    }
    match stats.blocks {
        Some(blocks) if !blocks.is_empty() && !blocks.contains(&expected_segment) => {
            Some(FlapReason::SegmentMismatch)
        }
        _ => None,
    }
}

/// Whitespace-collapsed prefix of `body`, at most `max_chars` characters plus an ellipsis marker.
pub fn snippet(body: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(body);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("reading snapshot {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing snapshot {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding snapshot {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding snapshot for {slug}: {source}")]
    Encode {
        slug: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFileState {
    pub path: PathBuf,
    pub exists: bool,
    pub listings: Option<usize>,
}

/// One JSON snapshot file per segment under a shared directory, guarded by one RW lock.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    env: String,
    lock: Arc<RwLock<()>>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, env: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            env: env.into(),
            lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, slug: &str) -> PathBuf {
        self.root.join(format!("{slug}_{}.json", self.env))
    }

    /// Reads a snapshot; a missing file is an empty snapshot.
    pub async fn read(&self, slug: &str) -> Result<Snapshot, StorageError> {
        let _shared = self.lock.read().await;
        self.read_unlocked(slug).await
    }

    pub async fn write(&self, slug: &str, snapshot: &Snapshot) -> Result<(), StorageError> {
        let _exclusive = self.lock.write().await;
        self.write_unlocked(slug, snapshot).await
    }

    /// Read-modify-write of one segment under the exclusive lock.
    pub async fn update<T, F>(&self, slug: &str, apply: F) -> Result<T, StorageError>
    where
        F: FnOnce(Snapshot) -> (Snapshot, T),
    {
        let _exclusive = self.lock.write().await;
        let prior = self.read_unlocked(slug).await?;
        let (next, out) = apply(prior);
        self.write_unlocked(slug, &next).await?;
        Ok(out)
    }

    /// Best-effort description of the snapshot file for diagnostics.
    pub async fn file_state(&self, slug: &str) -> StorageFileState {
        let path = self.path_for(slug);
        let exists = fs::try_exists(&path).await.unwrap_or(false);
        let listings = if exists {
            self.read(slug).await.ok().map(|snapshot| snapshot.flats.len())
        } else {
            None
        };
        StorageFileState {
            path,
            exists,
            listings,
        }
    }

    async fn read_unlocked(&self, slug: &str) -> Result<Snapshot, StorageError> {
        let path = self.path_for(slug);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Snapshot::default()),
            Err(source) => return Err(StorageError::Read { path, source }),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Snapshot::default());
        }
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Decode { path, source })
    }

    async fn write_unlocked(&self, slug: &str, snapshot: &Snapshot) -> Result<(), StorageError> {
        let path = self.path_for(slug);
        let bytes = serde_json::to_vec(snapshot).map_err(|source| StorageError::Encode {
            slug: slug.to_string(),
            source,
        })?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Write {
                path: self.root.clone(),
                source,
            })?;

        let temp_path = self
            .root
            .join(format!(".{slug}.{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        if let Err(source) = write_new_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Write {
                path: temp_path,
                source,
            });
        }

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Write { path, source });
        }
        Ok(())
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
