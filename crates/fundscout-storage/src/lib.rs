//! HTTP fetch utilities and file-backed result stores for fundscout.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fundscout_core::{ApplicationPathResult, MatchResult};
pub use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundscout-storage";

/// Browser-like default so opportunity sites serve the same markup they serve
/// a person.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/91.0.4472.124 Safari/537.36";

/// Server-side hiccups and throttling are worth another attempt; client
/// errors are not.
fn transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Doubling delay between repeat attempts, capped at `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before_retry(&self, retries_done: u32) -> Duration {
        let mut delay = self.first_delay;
        for _ in 0..retries_done {
            delay = delay.saturating_mul(2);
            if delay >= self.ceiling {
                return self.ceiling;
            }
        }
        delay.min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_parallel: usize,
    pub max_parallel_per_host: usize,
    pub retry: RetryPolicy,
    /// Minimum spacing between consecutive requests, across all hosts.
    pub courtesy_delay: Option<Duration>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_parallel: 16,
            max_parallel_per_host: 2,
            retry: RetryPolicy::default(),
            courtesy_delay: None,
        }
    }
}

/// Enforces the courtesy spacing: each caller reserves the next free slot
/// under the lock, then sleeps outside it.
#[derive(Debug)]
struct CourtesyGate {
    spacing: Duration,
    next_free: Mutex<Option<Instant>>,
}

impl CourtesyGate {
    fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_free: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        let now = Instant::now();
        let my_slot = {
            let mut next_free = self.next_free.lock().await;
            let slot = match *next_free {
                Some(at) if at > now => at,
                _ => now,
            };
            *next_free = Some(slot + self.spacing);
            slot
        };
        if my_slot > now {
            tokio::time::sleep(my_slot - now).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("GET {url} failed: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },
    #[error("GET {url} returned status {status}")]
    Status { status: u16, url: String },
}

/// Shared GET client: redirects followed, explicit timeout, transient
/// failures retried with doubling delays, bounded parallelism per host.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    all_hosts: Arc<Semaphore>,
    host_limit: usize,
    host_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    courtesy: Option<CourtesyGate>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            all_hosts: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            host_limit: config.max_parallel_per_host.max(1),
            host_slots: Mutex::new(HashMap::new()),
            courtesy: config.courtesy_delay.map(CourtesyGate::new),
            retry: config.retry,
        })
    }

    async fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut slots = self.host_slots.lock().await;
        slots
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.host_limit)))
            .clone()
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _all = self.all_hosts.acquire().await.expect("semaphore not closed");
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let host_slot = self.host_semaphore(&host).await;
        let _host = host_slot.acquire().await.expect("semaphore not closed");

        if let Some(gate) = &self.courtesy {
            gate.wait_turn().await;
        }

        let span = info_span!("fetch", url);
        let _guard = span.enter();

        let mut retries_done = 0u32;
        loop {
            let outcome = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = resp.bytes().await.map_err(|source| FetchError::Transport {
                        url: url.to_string(),
                        source,
                    })?;
                    return Ok(FetchedPage {
                        status,
                        final_url,
                        content_type,
                        body: body.to_vec(),
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::Status {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (transient_status(status), err)
                }
                Err(source) => {
                    let retryable = transient_error(&source);
                    let err = FetchError::Transport {
                        url: url.to_string(),
                        source,
                    };
                    (retryable, err)
                }
            };

            let (retryable, err) = outcome;
            if !retryable || retries_done >= self.retry.retries {
                return Err(err);
            }
            tokio::time::sleep(self.retry.delay_before_retry(retries_done)).await;
            retries_done += 1;
        }
    }
}

/// One cached discovery outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPath {
    pub starting_url: String,
    pub cached_at: DateTime<Utc>,
    pub result: ApplicationPathResult,
}

/// Disk cache of [`ApplicationPathResult`] keyed by starting URL. Entries are
/// hash-addressed JSON files written via atomic temp-file rename; they never
/// expire on their own and are removed only by operator invalidation.
#[derive(Debug, Clone)]
pub struct PathCache {
    root: PathBuf,
}

impl PathCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_for(starting_url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(starting_url.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, starting_url: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::key_for(starting_url)))
    }

    /// Look up a cached result. A missing entry returns `None`; a corrupt
    /// entry is logged and treated as absent rather than failing the caller.
    pub async fn get(&self, starting_url: &str) -> anyhow::Result<Option<CachedPath>> {
        let path = self.path_for(starting_url);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading cache entry {}", path.display()))
            }
        };
        match serde_json::from_slice::<CachedPath>(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                warn!(path = %path.display(), %err, "discarding unreadable cache entry");
                Ok(None)
            }
        }
    }

    pub async fn put(
        &self,
        starting_url: &str,
        result: &ApplicationPathResult,
    ) -> anyhow::Result<CachedPath> {
        let entry = CachedPath {
            starting_url: starting_url.to_string(),
            cached_at: Utc::now(),
            result: result.clone(),
        };
        let path = self.path_for(starting_url);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }

        let bytes = serde_json::to_vec_pretty(&entry).context("serializing cache entry")?;
        let temp_path = path
            .parent()
            .expect("cache path always has parent")
            .join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating temp cache file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        fs::rename(&temp_path, &path).await.with_context(|| {
            format!(
                "atomically renaming cache entry {} -> {}",
                temp_path.display(),
                path.display()
            )
        })?;
        Ok(entry)
    }

    /// Operator action: drop the entry for one starting URL. Returns whether
    /// an entry existed.
    pub async fn invalidate(&self, starting_url: &str) -> anyhow::Result<bool> {
        let path = self.path_for(starting_url);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("removing cache entry {}", path.display()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// In-memory set of match results with at most one entry per
/// `(profile_id, opportunity_id)`. Recomputation overwrites in place, so
/// reruns never grow the store. Snapshots round-trip through JSON.
#[derive(Debug, Default, Clone)]
pub struct MatchStore {
    entries: BTreeMap<(String, String), MatchResult>,
}

impl MatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, result: MatchResult) -> UpsertOutcome {
        let key = (result.profile_id.clone(), result.opportunity_id.clone());
        match self.entries.insert(key, result) {
            None => UpsertOutcome::Created,
            Some(_) => UpsertOutcome::Updated,
        }
    }

    pub fn get(&self, profile_id: &str, opportunity_id: &str) -> Option<&MatchResult> {
        self.entries
            .get(&(profile_id.to_string(), opportunity_id.to_string()))
    }

    /// Results for one profile ordered the way rankings are displayed:
    /// relevance desc, win rate desc, opportunity id asc.
    pub fn for_profile(&self, profile_id: &str) -> Vec<&MatchResult> {
        let mut results: Vec<&MatchResult> = self
            .entries
            .values()
            .filter(|r| r.profile_id == profile_id)
            .collect();
        results.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then(b.win_rate.total_cmp(&a.win_rate))
                .then(a.opportunity_id.cmp(&b.opportunity_id))
        });
        results
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let results: Vec<&MatchResult> = self.entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&results).context("serializing match store")?;
        fs::write(path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let results: Vec<MatchResult> =
            serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let mut store = Self::new();
        for result in results {
            store.upsert(result);
        }
        Ok(store)
    }
}
