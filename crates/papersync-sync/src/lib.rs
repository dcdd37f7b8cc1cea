//! Sync driver: fetch, enrich, aggregate, upsert, finalize.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use papersync_adapters::{
    AdapterError, ArxivListingFetcher, FixtureSource, ListingConfig, PassthroughPhraseExtractor,
    PhraseExtractor, SourceFetcher,
};
use papersync_core::{
    rank_hot_phrases, run_month_for, CrawlRun, NormalizedPaper, PhraseList, RawPaper,
    RunCompletion, UpsertCounts, HOT_PHRASE_LIMIT,
};
use papersync_storage::{Catalog, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "papersync-sync";

/// Slack past the run timeout before a `running` row is presumed orphaned.
const STALE_RUN_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub listing: ListingConfig,
    pub detail_concurrency: usize,
    pub batch_size: usize,
    pub run_timeout_secs: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub phrase_rules_path: PathBuf,
    /// Read papers from a JSON bundle instead of arXiv.
    pub fixture_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://papersync.db".to_string(),
            listing: ListingConfig::default(),
            detail_concurrency: 4,
            batch_size: 100,
            run_timeout_secs: 3600,
            user_agent: "papersync-bot/0.1".to_string(),
            http_timeout_secs: 30,
            scheduler_enabled: false,
            sync_cron: "0 0 3 1 * *".to_string(),
            phrase_rules_path: PathBuf::from("rules/phrases.yaml"),
            fixture_path: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, fallback: T) -> T {
    env_string(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

fn env_flag(key: &str, fallback: bool) -> bool {
    env_string(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(fallback)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            listing: ListingConfig {
                base_url: env_string("PAPERSYNC_LISTING_URL").unwrap_or(defaults.listing.base_url),
                max_papers: env_parse("PAPERSYNC_MAX_PAPERS", defaults.listing.max_papers),
                page_size: env_parse("PAPERSYNC_PAGE_SIZE", defaults.listing.page_size),
                fetch_details: env_flag("PAPERSYNC_FETCH_DETAILS", defaults.listing.fetch_details),
            },
            detail_concurrency: env_parse(
                "PAPERSYNC_DETAIL_CONCURRENCY",
                defaults.detail_concurrency,
            ),
            batch_size: env_parse("PAPERSYNC_BATCH_SIZE", defaults.batch_size),
            run_timeout_secs: env_parse("PAPERSYNC_RUN_TIMEOUT_SECS", defaults.run_timeout_secs),
            user_agent: env_string("PAPERSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("PAPERSYNC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            scheduler_enabled: env_flag("PAPERSYNC_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            sync_cron: env_string("PAPERSYNC_CRON").unwrap_or(defaults.sync_cron),
            phrase_rules_path: env_string("PAPERSYNC_PHRASE_RULES")
                .map(PathBuf::from)
                .unwrap_or(defaults.phrase_rules_path),
            fixture_path: env_string("PAPERSYNC_FIXTURE").map(PathBuf::from),
        }
    }

    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            detail_concurrency: self.detail_concurrency.max(1),
            batch_size: self.batch_size.max(1),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
        }
    }
}

// ---- phrase rules ----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct PhraseRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<PhraseRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PhraseRule {
    pub phrase: String,
    pub contains_any: Vec<String>,
}

/// Tags a paper with every rule phrase whose needle appears in its title or abstract.
#[derive(Debug, Clone, Default)]
pub struct YamlPhraseExtractor {
    rules: Vec<PhraseRule>,
}

impl YamlPhraseExtractor {
    pub fn new(rules: Vec<PhraseRule>) -> Self {
        Self { rules }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: PhraseRulesFile = serde_yaml::from_str(yaml).context("parsing phrase rules")?;
        Ok(Self::new(file.rules))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    pub fn rules(&self) -> &[PhraseRule] {
        &self.rules
    }
}

impl PhraseExtractor for YamlPhraseExtractor {
    fn extract(&self, paper: &RawPaper) -> Result<Vec<String>, AdapterError> {
        let haystack = paper.searchable_text().to_lowercase();
        let mut phrases = paper.phrases();
        for rule in &self.rules {
            if rule
                .contains_any
                .iter()
                .any(|needle| haystack.contains(&needle.to_lowercase()))
                && !phrases.contains(&rule.phrase)
            {
                phrases.push(rule.phrase.clone());
            }
        }
        Ok(phrases)
    }
}

/// Rule-based extractor when the rules file exists, otherwise source phrases only.
pub fn load_phrase_extractor(path: &Path) -> Result<Arc<dyn PhraseExtractor>> {
    if path.exists() {
        let extractor = YamlPhraseExtractor::from_path(path)?;
        info!(path = %path.display(), rules = extractor.rules().len(), "phrase rules loaded");
        Ok(Arc::new(extractor))
    } else {
        warn!(path = %path.display(), "phrase rules missing; keeping source phrases only");
        Ok(Arc::new(PassthroughPhraseExtractor))
    }
}

// ---- driver ----------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DriverOptions {
    /// Detail-page worker count.
    pub detail_concurrency: usize,
    pub batch_size: usize,
    pub run_timeout: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        SyncConfig::default().driver_options()
    }
}

/// Fetched and enriched records, ready to upsert.
#[derive(Debug, Clone, Default)]
pub struct PreparedRun {
    pub papers: Vec<RawPaper>,
    pub hot_phrases: Vec<String>,
    pub detail_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    pub run_month: String,
    pub total_papers: usize,
    pub hot_phrases: Vec<String>,
    pub papers: Vec<NormalizedPaper>,
}

/// Repeated arXiv ids keep the position of their first record and the
/// content of their last. Unkeyed records pass through untouched.
fn collapse_repeated_ids(papers: Vec<RawPaper>) -> Vec<RawPaper> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut collapsed: Vec<RawPaper> = Vec::with_capacity(papers.len());
    for paper in papers {
        match paper.key().map(str::to_string) {
            Some(key) => match slots.get(&key) {
                Some(&slot) => collapsed[slot] = paper,
                None => {
                    slots.insert(key, collapsed.len());
                    collapsed.push(paper);
                }
            },
            None => collapsed.push(paper),
        }
    }
    collapsed
}

/// One-line run summary persisted on completed runs.
pub fn run_log_line(
    counts: UpsertCounts,
    dropped: usize,
    detail_failures: usize,
    hot_phrases: &[String],
) -> String {
    let mut line = format!(
        "new_papers={} | updated={} | dropped={dropped} | detail_failures={detail_failures}",
        counts.inserted, counts.updated
    );
    if !hot_phrases.is_empty() {
        line.push_str(" | hot_phrases=");
        line.push_str(&hot_phrases.join(", "));
    }
    line
}

pub struct SyncDriver {
    catalog: Catalog,
    source: Arc<dyn SourceFetcher>,
    extractor: Arc<dyn PhraseExtractor>,
    options: DriverOptions,
}

impl SyncDriver {
    pub fn new(
        catalog: Catalog,
        source: Arc<dyn SourceFetcher>,
        extractor: Arc<dyn PhraseExtractor>,
        options: DriverOptions,
    ) -> Self {
        Self {
            catalog,
            source,
            extractor,
            options,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Acquire admission and run to completion in the foreground.
    /// `None` when another run already holds admission.
    pub async fn run_once(&self, run_month: &str) -> Result<Option<CrawlRun>> {
        let Some(run) = self.acquire(run_month).await? else {
            return Ok(None);
        };
        let run_id = run.id;
        self.run_admitted(run)
            .instrument(info_span!("sync_run", %run_id, run_month))
            .await
            .map(Some)
    }

    /// Expire runs left `running` by a dead process, then try to take admission.
    pub async fn acquire(&self, run_month: &str) -> Result<Option<CrawlRun>> {
        self.catalog
            .expire_stale_runs(self.options.run_timeout.saturating_add(STALE_RUN_GRACE))
            .await
            .context("expiring stale runs")?;
        self.catalog
            .try_acquire(run_month)
            .await
            .context("acquiring run admission")
    }

    /// Drive an already-admitted run to a terminal state and return the final row.
    pub async fn run_admitted(&self, run: CrawlRun) -> Result<CrawlRun> {
        let timeout = self.options.run_timeout;
        let outcome = tokio::time::timeout(timeout, self.execute(&run)).await;
        let finished = match outcome {
            Ok(Ok(completion)) => self.catalog.complete_run(run.id, &completion).await,
            Ok(Err(err)) => self.catalog.fail_run(run.id, &format!("{err:#}")).await,
            Err(_) => {
                let message = format!("run timed out after {}s", timeout.as_secs());
                self.catalog.fail_run(run.id, &message).await
            }
        };
        finished.with_context(|| format!("finalizing run {}", run.id))
    }

    async fn execute(&self, run: &CrawlRun) -> Result<RunCompletion> {
        let prepared = self.prepare(&run.run_month).await?;

        let mut counts = UpsertCounts::default();
        for batch in prepared.papers.chunks(self.options.batch_size.max(1)) {
            counts += self
                .catalog
                .upsert_papers(run.id, batch)
                .await
                .context("upserting paper batch")?;
        }

        let dropped = prepared
            .papers
            .iter()
            .filter(|p| p.key().is_none())
            .count();
        let log = run_log_line(counts, dropped, prepared.detail_failures, &prepared.hot_phrases);
        info!(run_id = %run.id, %log, "run processed");
        Ok(RunCompletion {
            total_papers: u32::try_from(counts.total()).unwrap_or(u32::MAX),
            new_papers_count: u32::try_from(counts.inserted).unwrap_or(u32::MAX),
            hot_phrases: prepared.hot_phrases,
            log: Some(log),
        })
    }

    /// Listing, detail pass, phrase extraction and ranking. Touches no stored state.
    pub async fn prepare(&self, run_month: &str) -> Result<PreparedRun> {
        let listing = self
            .source
            .fetch_listing(run_month)
            .await
            .with_context(|| format!("fetching {} listing for {run_month}", self.source.source_id()))?;

        let (mut papers, detail_failures) = if self.source.wants_details() {
            self.fetch_details(listing).await
        } else {
            (listing, 0)
        };

        for paper in &mut papers {
            let phrases = self.extractor.extract(paper).with_context(|| {
                format!(
                    "extracting phrases for {}",
                    paper.key().unwrap_or("unkeyed record")
                )
            })?;
            paper.algorithm_phrase = (!phrases.is_empty()).then_some(PhraseList::Many(phrases));
        }

        let papers = collapse_repeated_ids(papers);
        let hot_phrases = rank_hot_phrases(
            papers
                .iter()
                .filter(|p| p.key().is_some())
                .map(RawPaper::phrases),
            HOT_PHRASE_LIMIT,
        );
        Ok(PreparedRun {
            papers,
            hot_phrases,
            detail_failures,
        })
    }

    /// Bounded fan-out over detail pages, joined before returning.
    async fn fetch_details(&self, mut papers: Vec<RawPaper>) -> (Vec<RawPaper>, usize) {
        let permits = Arc::new(Semaphore::new(self.options.detail_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (index, paper) in papers.iter().enumerate() {
            if paper.key().is_none() {
                continue;
            }
            let source = Arc::clone(&self.source);
            let permits = Arc::clone(&permits);
            let paper = paper.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                (index, source.fetch_detail(&paper).await)
            });
        }

        let mut failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(Some(detail)))) => papers[index].apply_detail(detail),
                Ok((_, Ok(None))) => {}
                Ok((index, Err(err))) => {
                    failures += 1;
                    warn!(
                        arxiv_id = papers[index].key().unwrap_or_default(),
                        error = %err,
                        "detail fetch failed; keeping listing fields"
                    );
                }
                Err(err) => {
                    failures += 1;
                    warn!(error = %err, "detail task did not finish");
                }
            }
        }
        (papers, failures)
    }

    /// Fetch, extract and rank without touching the catalog; optionally write the report as JSON.
    pub async fn dry_run(&self, run_month: &str, output: Option<&Path>) -> Result<DryRunReport> {
        let prepared = self.prepare(run_month).await?;
        let papers: Vec<NormalizedPaper> =
            prepared.papers.iter().filter_map(RawPaper::normalize).collect();
        let report = DryRunReport {
            run_month: run_month.to_string(),
            total_papers: papers.len(),
            hot_phrases: prepared.hot_phrases,
            papers,
        };

        if let Some(path) = output {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            fs::write(path, serde_json::to_vec_pretty(&report)?)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), total_papers = report.total_papers, "dry-run report written");
        }
        Ok(report)
    }
}

// ---- trigger surface -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Accepted { run_id: Uuid },
    AlreadyRunning,
}

/// Admission check in the caller's task, the run itself in the background.
#[derive(Clone)]
pub struct SyncService {
    driver: Arc<SyncDriver>,
}

impl SyncService {
    pub fn new(driver: SyncDriver) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    pub fn driver(&self) -> &SyncDriver {
        &self.driver
    }

    pub fn catalog(&self) -> &Catalog {
        self.driver.catalog()
    }

    pub async fn trigger(&self) -> Result<TriggerOutcome> {
        self.trigger_for(&run_month_for(Utc::now())).await
    }

    pub async fn trigger_for(&self, run_month: &str) -> Result<TriggerOutcome> {
        let Some(run) = self.driver.acquire(run_month).await? else {
            return Ok(TriggerOutcome::AlreadyRunning);
        };

        let run_id = run.id;
        let driver = Arc::clone(&self.driver);
        let span = info_span!("sync_run", %run_id, run_month);
        tokio::spawn(
            async move {
                if let Err(err) = driver.run_admitted(run).await {
                    error!(error = %format!("{err:#}"), "run could not be finalized");
                }
            }
            .instrument(span),
        );
        Ok(TriggerOutcome::Accepted { run_id })
    }
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    service: SyncService,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            match service.trigger().await {
                Ok(TriggerOutcome::Accepted { run_id }) => {
                    info!(%run_id, "scheduled sync started")
                }
                Ok(TriggerOutcome::AlreadyRunning) => {
                    warn!("scheduled sync skipped: a run is already in progress")
                }
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed to start"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "sync scheduler configured");
    Ok(Some(sched))
}

/// Source selected by config: the fixture bundle when set, else live arXiv.
pub fn build_source(config: &SyncConfig) -> Result<Arc<dyn SourceFetcher>> {
    if let Some(path) = &config.fixture_path {
        return Ok(Arc::new(FixtureSource::load(path)?));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        max_concurrency: config.detail_concurrency.max(1),
        ..Default::default()
    })?;
    Ok(Arc::new(ArxivListingFetcher::new(http, config.listing.clone())))
}

pub async fn build_driver(config: &SyncConfig) -> Result<SyncDriver> {
    let catalog = Catalog::connect(&config.database_url)
        .await
        .with_context(|| format!("opening catalog {}", config.database_url))?;
    let source = build_source(config)?;
    let extractor = load_phrase_extractor(&config.phrase_rules_path)?;
    Ok(SyncDriver::new(
        catalog,
        source,
        extractor,
        config.driver_options(),
    ))
}

pub async fn run_sync_once_from_env() -> Result<Option<CrawlRun>> {
    let config = SyncConfig::from_env();
    let driver = build_driver(&config).await?;
    driver.run_once(&run_month_for(Utc::now())).await
}
