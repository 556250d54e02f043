//! Document-store ingestion and the batch match pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundscout_core::{
    ApplicationPathResult, FundingType, MatchResult, Opportunity, Profile,
};
use fundscout_crawler::{CrawlConfig, PageFetcher, PathFinder};
use fundscout_match::MatchRanker;
use fundscout_storage::{
    FetcherConfig, HttpFetcher, MatchStore, PathCache, UpsertOutcome, DEFAULT_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundscout-sync";

/// One raw document as the upstream store hands it over: a stable id plus an
/// arbitrary JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    pub fields: JsonValue,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Injected document-store client. The pipeline never constructs one itself,
/// so tests and alternative backends plug in the same way.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn list_opportunities(&self, collection: &str)
        -> Result<Vec<RawDocument>, SourceError>;

    async fn fetch_profile(&self, profile_id: &str) -> Result<Option<RawDocument>, SourceError>;
}

/// File-backed source reading `fixtures/<collection>.json` (array of
/// documents) and `profiles/<id>.json` under a root directory.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    root: PathBuf,
}

impl JsonFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DocumentSource for JsonFileSource {
    async fn list_opportunities(
        &self,
        collection: &str,
    ) -> Result<Vec<RawDocument>, SourceError> {
        let path = self.root.join("fixtures").join(format!("{collection}.json"));
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let values: Vec<JsonValue> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(values
            .into_iter()
            .enumerate()
            .map(|(index, fields)| {
                let id = fields
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{collection}-{index}"));
                RawDocument { id, fields }
            })
            .collect())
    }

    async fn fetch_profile(&self, profile_id: &str) -> Result<Option<RawDocument>, SourceError> {
        let path = self.root.join("profiles").join(format!("{profile_id}.json"));
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SourceError::Anyhow(anyhow::Error::new(err).context(format!(
                    "reading {}",
                    path.display()
                ))))
            }
        };
        let fields: JsonValue =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(RawDocument {
            id: profile_id.to_string(),
            fields,
        }))
    }
}

/// Registry of syncable collections; absent file means every collection in
/// the funding-type table is enabled.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub funding_type: FundingType,
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn enabled_collections(&self) -> Vec<&str> {
        self.collections
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.name.as_str())
            .collect()
    }
}

fn string_field(fields: &JsonValue, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(text) = fields.get(*key).and_then(|v| v.as_str()) {
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn string_list_field(fields: &JsonValue, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Some(items) = fields.get(*key).and_then(|v| v.as_array()) {
            return items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect();
        }
    }
    Vec::new()
}

/// Field names folded into the typed opportunity shape; everything else rides
/// along in `extra`.
const CONSUMED_KEYS: &[&str] = &[
    "id",
    "title",
    "description",
    "summary",
    "agency",
    "department",
    "closeDate",
    "deadline",
    "city",
    "state",
    "url",
    "synopsisUrl",
    "link",
    "contactEmail",
    "contactPhone",
    "collection",
];

/// Fold a raw document into the canonical opportunity shape. Missing or
/// mistyped fields become absent values; this function cannot fail.
pub fn normalize_opportunity(doc: &RawDocument, collection: &str) -> Opportunity {
    let fields = &doc.fields;
    let mut extra = serde_json::Map::new();
    if let Some(object) = fields.as_object() {
        for (key, value) in object {
            if !CONSUMED_KEYS.contains(&key.as_str()) {
                extra.insert(key.clone(), value.clone());
            }
        }
    }

    Opportunity {
        id: doc.id.clone(),
        collection: collection.to_string(),
        title: string_field(fields, &["title"]),
        description: string_field(fields, &["description"]),
        summary: string_field(fields, &["summary"]),
        agency: string_field(fields, &["agency"]),
        department: string_field(fields, &["department"]),
        close_date: string_field(fields, &["closeDate", "deadline"]),
        city: string_field(fields, &["city"]),
        state: string_field(fields, &["state"]),
        url: string_field(fields, &["url"]),
        synopsis_url: string_field(fields, &["synopsisUrl"]),
        link: string_field(fields, &["link"]),
        contact_email: string_field(fields, &["contactEmail"]),
        contact_phone: string_field(fields, &["contactPhone"]),
        extra,
    }
}

/// Fold a raw profile document into the normalized profile. Unknown funding
/// type labels are logged and dropped rather than failing the run.
pub fn normalize_profile(doc: &RawDocument) -> Profile {
    let fields = &doc.fields;
    let funding_types = string_list_field(fields, &["funding_types", "funding_type_preferences"])
        .iter()
        .filter_map(|label| {
            let parsed = FundingType::parse(label);
            if parsed.is_none() {
                warn!(%label, "unknown funding type label in profile, ignoring");
            }
            parsed
        })
        .collect();

    Profile {
        id: doc.id.clone(),
        organization_name: string_field(fields, &["organization_name", "organizationName"]),
        main_keywords: string_list_field(fields, &["main_keywords", "interests_main"]),
        sub_keywords: string_list_field(fields, &["sub_keywords", "interests_sub"]),
        funding_types,
        location: string_field(fields, &["location", "state"]),
        annual_budget_usd: fields
            .get("annual_budget_usd")
            .or_else(|| fields.get("annual_budget"))
            .and_then(|v| v.as_u64()),
    }
    .normalized()
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub registry_path: PathBuf,
    pub reports_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub matches_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_crawl_depth: usize,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl SyncConfig {
    /// Defaults rooted at a workspace directory; used directly by tests.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            registry_path: root.join("sources.yaml"),
            reports_dir: root.join("reports"),
            cache_dir: root.join("cache").join("paths"),
            matches_path: root.join("matches.json"),
            workspace_root: root,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 10,
            max_crawl_depth: 2,
            scheduler_enabled: false,
            sync_cron_1: "0 6 * * *".to_string(),
            sync_cron_2: "0 18 * * *".to_string(),
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("FUNDSCOUT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut config = Self::for_workspace(root);

        if let Ok(ua) = std::env::var("FUNDSCOUT_USER_AGENT") {
            config.user_agent = ua;
        }
        if let Some(timeout) = std::env::var("FUNDSCOUT_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.http_timeout_secs = timeout;
        }
        if let Some(depth) = std::env::var("FUNDSCOUT_MAX_CRAWL_DEPTH")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.max_crawl_depth = depth;
        }
        config.scheduler_enabled = std::env::var("FUNDSCOUT_SCHEDULER_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        if let Ok(cron) = std::env::var("FUNDSCOUT_SYNC_CRON_1") {
            config.sync_cron_1 = cron;
        }
        if let Ok(cron) = std::env::var("FUNDSCOUT_SYNC_CRON_2") {
            config.sync_cron_2 = cron;
        }
        config
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchRunSummary {
    pub run_id: Uuid,
    pub profile_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub collections_scanned: usize,
    pub collections_failed: usize,
    pub fetched_records: usize,
    pub ranked_matches: usize,
    pub created: usize,
    pub updated: usize,
    pub reports_dir: String,
}

/// Orchestrates one profile's match run: pull, normalize, rank, upsert,
/// report. A failing collection or record degrades the run, never aborts it.
pub struct MatchPipeline {
    config: SyncConfig,
    source: Box<dyn DocumentSource>,
    finder: PathFinder,
    path_cache: PathCache,
}

impl MatchPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn DocumentSource>) -> Result<Self> {
        let fetcher = HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        let finder = PathFinder::new(
            Arc::new(fetcher),
            CrawlConfig {
                max_depth: config.max_crawl_depth,
            },
        );
        let path_cache = PathCache::new(config.cache_dir.clone());
        Ok(Self {
            config,
            source,
            finder,
            path_cache,
        })
    }

    /// Swap the page fetcher behind application-path discovery; tests use an
    /// in-memory site.
    pub fn with_page_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.finder = PathFinder::new(
            fetcher,
            CrawlConfig {
                max_depth: self.config.max_crawl_depth,
            },
        );
        self
    }

    async fn load_registry(&self) -> Result<Option<SourceRegistry>> {
        let path = &self.config.registry_path;
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", path.display())))
            }
        };
        let registry: SourceRegistry =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(registry))
    }

    /// Collections this run should scan: the profile's funding preferences
    /// intersected with the registry's enabled set (registry absent means the
    /// full funding-type table).
    fn collections_for_run(profile: &Profile, registry: Option<&SourceRegistry>) -> Vec<String> {
        let preferred: Vec<&str> = if profile.funding_types.is_empty() {
            FundingType::all_collections()
        } else {
            FundingType::collections_for(&profile.funding_types)
        };
        match registry {
            None => preferred.iter().map(|c| c.to_string()).collect(),
            Some(registry) => {
                let enabled = registry.enabled_collections();
                preferred
                    .iter()
                    .filter(|c| enabled.contains(*c))
                    .map(|c| c.to_string())
                    .collect()
            }
        }
    }

    pub async fn run_matches(&self, profile_id: &str) -> Result<MatchRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let profile_doc = self
            .source
            .fetch_profile(profile_id)
            .await
            .with_context(|| format!("fetching profile {profile_id}"))?
            .with_context(|| format!("no profile document for {profile_id}"))?;
        let profile = normalize_profile(&profile_doc);

        let registry = self.load_registry().await?;
        let collections = Self::collections_for_run(&profile, registry.as_ref());

        let mut opportunities: Vec<Opportunity> = Vec::new();
        let mut collections_failed = 0usize;
        for collection in &collections {
            match self.source.list_opportunities(collection).await {
                Ok(docs) => {
                    opportunities.extend(
                        docs.iter().map(|doc| normalize_opportunity(doc, collection)),
                    );
                }
                Err(err) => {
                    collections_failed += 1;
                    warn!(%collection, %err, "collection listing failed, skipping");
                }
            }
        }
        let fetched_records = opportunities.len();

        let ranker = MatchRanker::new(profile);
        let results = ranker.rank(&opportunities);

        let mut store = if fs::try_exists(&self.config.matches_path)
            .await
            .unwrap_or(false)
        {
            MatchStore::load(&self.config.matches_path).await?
        } else {
            MatchStore::new()
        };

        let mut created = 0usize;
        let mut updated = 0usize;
        for result in &results {
            match store.upsert(result.clone()) {
                UpsertOutcome::Created => created += 1,
                UpsertOutcome::Updated => updated += 1,
            }
        }
        store.save(&self.config.matches_path).await?;

        let finished_at = Utc::now();
        let mut summary = MatchRunSummary {
            run_id,
            profile_id: profile_id.to_string(),
            started_at,
            finished_at,
            collections_scanned: collections.len(),
            collections_failed,
            fetched_records,
            ranked_matches: results.len(),
            created,
            updated,
            reports_dir: String::new(),
        };
        let reports_dir = self.write_reports(&summary, &results).await?;
        summary.reports_dir = reports_dir.display().to_string();
        Ok(summary)
    }

    /// Discovery with the starting-URL cache in front. Always yields a
    /// well-formed result; cache faults are logged and bypassed.
    pub async fn discover_application_path(
        &self,
        opportunity: &Opportunity,
    ) -> ApplicationPathResult {
        let cache_key = opportunity
            .start_url_candidates()
            .first()
            .map(|u| u.to_string());

        if let Some(key) = cache_key.as_deref() {
            match self.path_cache.get(key).await {
                Ok(Some(hit)) => return hit.result,
                Ok(None) => {}
                Err(err) => warn!(%key, %err, "path cache read failed, recomputing"),
            }
        }

        let result = self.finder.discover(opportunity).await;

        if let Some(key) = cache_key.as_deref() {
            if let Err(err) = self.path_cache.put(key, &result).await {
                warn!(%key, %err, "path cache write failed");
            }
        }
        result
    }

    /// Operator action: forget the cached path for a starting URL.
    pub async fn invalidate_application_path(&self, starting_url: &str) -> Result<bool> {
        self.path_cache.invalidate(starting_url).await
    }

    async fn write_reports(
        &self,
        summary: &MatchRunSummary,
        results: &[MatchResult],
    ) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let mut urgency_counts: BTreeMap<String, usize> = BTreeMap::new();
        for result in results {
            *urgency_counts.entry(result.urgency.to_string()).or_default() += 1;
        }

        let top_lines = results
            .iter()
            .take(10)
            .map(|r| {
                format!(
                    "- {} (win rate {:.0}%, relevance {:.1})",
                    r.opportunity_id, r.win_rate, r.relevance_score
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let brief = format!(
            "# Fundscout Match Brief\n\n- Run ID: `{}`\n- Profile: {}\n- Started: {}\n- Finished: {}\n- Collections scanned: {} ({} failed)\n- Records considered: {}\n- Ranked matches: {}\n\n## Urgency\n{}\n\n## Top Matches\n{}\n",
            summary.run_id,
            summary.profile_id,
            summary.started_at,
            summary.finished_at,
            summary.collections_scanned,
            summary.collections_failed,
            summary.fetched_records,
            summary.ranked_matches,
            urgency_counts
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n"),
            top_lines
        );
        fs::write(reports_dir.join("match_brief.md"), brief)
            .await
            .context("writing match_brief.md")?;

        let delta = serde_json::to_vec_pretty(&serde_json::json!({
            "run": summary,
            "matches": results,
        }))
        .context("serializing match delta")?;
        fs::write(reports_dir.join("match_delta.json"), delta)
            .await
            .context("writing match_delta.json")?;

        Ok(reports_dir)
    }

    /// Optional cron wiring: when enabled, each cron slot sends the fire time
    /// on `trigger` and the caller decides what run to start.
    pub async fn maybe_build_scheduler(
        &self,
        trigger: tokio::sync::mpsc::Sender<DateTime<Utc>>,
    ) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let tx = trigger.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let tx = tx.clone();
                Box::pin(async move {
                    if tx.send(Utc::now()).await.is_err() {
                        warn!("scheduled run trigger dropped, receiver gone");
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}
