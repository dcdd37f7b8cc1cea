//! Durable paper catalog (papers + crawl runs) and HTTP fetch utilities.
//!
//! The catalog owns three concerns that share one SQL schema:
//! the paper store (merge-on-conflict upsert and search), the run lifecycle
//! (`running -> completed | failed`), and the admission guard, which is the
//! partial unique index on `crawl_runs.status = 'running'` plus a conditional
//! insert. Nothing about the "is a run active" state lives in memory.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use papersync_core::{
    elapsed_whole_seconds, CrawlRun, NormalizedPaper, Paper, PaperPage, PaperQuery, RawPaper,
    RunCompletion, RunStatus, RunWithPapers, UpsertCounts,
};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "papersync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("run {0} is still running")]
    RunInProgress(Uuid),
    #[error("invalid page request: {0}")]
    InvalidPage(String),
    #[error("corrupt catalog row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Encoding(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Recorded on runs whose owning process vanished before finishing.
pub const STALE_RUN_MESSAGE: &str = "abandoned: exceeded run timeout";

const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS crawl_runs (
  id TEXT PRIMARY KEY,
  run_month TEXT NOT NULL,
  status TEXT NOT NULL,
  started_at TEXT NOT NULL,
  finished_at TEXT NULL,
  duration_seconds INTEGER NULL,
  total_papers INTEGER NOT NULL DEFAULT 0,
  new_papers_count INTEGER NOT NULL DEFAULT 0,
  hot_phrases TEXT NULL,
  error_message TEXT NULL,
  log TEXT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
)
"#,
    "CREATE INDEX IF NOT EXISTS crawl_runs_run_month_idx ON crawl_runs(run_month)",
    "CREATE INDEX IF NOT EXISTS crawl_runs_started_at_idx ON crawl_runs(started_at DESC)",
    // At most one running row, globally.
    "CREATE UNIQUE INDEX IF NOT EXISTS crawl_runs_single_running_idx ON crawl_runs(status) WHERE status = 'running'",
    r#"
CREATE TABLE IF NOT EXISTS papers (
  id TEXT PRIMARY KEY,
  arxiv_id TEXT NOT NULL UNIQUE,
  crawl_run_id TEXT NULL REFERENCES crawl_runs(id) ON DELETE SET NULL,
  title TEXT NULL,
  authors TEXT NULL,
  subjects TEXT NULL,
  abstract TEXT NULL,
  detail_title TEXT NULL,
  detail_dateline TEXT NULL,
  algorithm_phrase TEXT NULL,
  metadata TEXT NOT NULL DEFAULT '{}',
  observation_count INTEGER NOT NULL DEFAULT 1,
  search_text TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
)
"#,
    "CREATE INDEX IF NOT EXISTS papers_crawl_run_idx ON papers(crawl_run_id)",
    "CREATE INDEX IF NOT EXISTS papers_created_at_idx ON papers(created_at DESC)",
];

const RUN_COLUMNS: &str = "id, run_month, status, started_at, finished_at, duration_seconds, \
     total_papers, new_papers_count, hot_phrases, error_message, log, updated_at";

const PAPER_COLUMNS: &str = "id, arxiv_id, crawl_run_id, title, authors, subjects, abstract, \
     detail_title, detail_dateline, algorithm_phrase, metadata, observation_count, created_at, updated_at";

const UPSERT_PAPER_SQL: &str = r#"
INSERT INTO papers
  (id, arxiv_id, crawl_run_id, title, authors, subjects, abstract,
   detail_title, detail_dateline, algorithm_phrase, metadata,
   observation_count, search_text, created_at, updated_at)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?13, ?12, ?12)
ON CONFLICT(arxiv_id) DO UPDATE SET
  crawl_run_id = excluded.crawl_run_id,
  title = excluded.title,
  authors = excluded.authors,
  subjects = excluded.subjects,
  abstract = excluded.abstract,
  detail_title = excluded.detail_title,
  detail_dateline = excluded.detail_dateline,
  algorithm_phrase = excluded.algorithm_phrase,
  metadata = excluded.metadata,
  observation_count = papers.observation_count + 1,
  search_text = excluded.search_text,
  updated_at = excluded.updated_at
RETURNING observation_count
"#;

/// Fixed-width UTC text so that text order equals time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("uuid {s:?}: {e}")))
}

/// Separates fields in `search_text` so a keyword never spans two of them.
const SEARCH_FIELD_SEPARATOR: &str = "\u{1f}";

/// Lowercased haystack for keyword search. SQLite's `lower()` and `LIKE` only
/// fold ASCII, so folding happens here and in [`like_pattern`] instead.
fn search_text(row: &NormalizedPaper) -> String {
    [
        Some(row.arxiv_id.as_str()),
        row.title.as_deref(),
        row.abstract_text.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(|field| field.replace(SEARCH_FIELD_SEPARATOR, " ").to_lowercase())
    .collect::<Vec<_>>()
    .join(SEARCH_FIELD_SEPARATOR)
}

/// `%`, `_` and `\` are literal in user keywords.
fn like_pattern(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len() + 2);
    escaped.push('%');
    for c in keyword.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn row_to_run(row: &SqliteRow) -> StoreResult<CrawlRun> {
    let status: String = row.try_get("status")?;
    let hot_phrases: Option<String> = row.try_get("hot_phrases")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    Ok(CrawlRun {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        run_month: row.try_get("run_month")?,
        status: RunStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
        finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
        duration_seconds: row.try_get("duration_seconds")?,
        total_papers: row.try_get::<i64, _>("total_papers")?.max(0) as u32,
        new_papers_count: row.try_get::<i64, _>("new_papers_count")?.max(0) as u32,
        hot_phrases: match hot_phrases {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        },
        error_message: row.try_get("error_message")?,
        log: row.try_get("log")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_paper(row: &SqliteRow) -> StoreResult<Paper> {
    let crawl_run_id: Option<String> = row.try_get("crawl_run_id")?;
    let algorithm_phrase: Option<String> = row.try_get("algorithm_phrase")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Paper {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        arxiv_id: row.try_get("arxiv_id")?,
        crawl_run_id: crawl_run_id.as_deref().map(parse_uuid).transpose()?,
        title: row.try_get("title")?,
        authors: row.try_get("authors")?,
        subjects: row.try_get("subjects")?,
        abstract_text: row.try_get("abstract")?,
        detail_title: row.try_get("detail_title")?,
        detail_dateline: row.try_get("detail_dateline")?,
        algorithm_phrase: match algorithm_phrase {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        },
        metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata)?,
        observation_count: row.try_get::<i64, _>("observation_count")?.max(0) as u32,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (creating if missing) the catalog at `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let catalog = Self { pool };
        catalog.migrate().await?;
        info!(database_url, "catalog ready");
        Ok(catalog)
    }

    /// Private in-memory catalog. One pinned connection, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let catalog = Self { pool };
        catalog.migrate().await?;
        Ok(catalog)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- admission guard -------------------------------------------------

    pub async fn is_running(&self) -> StoreResult<bool> {
        let running: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM crawl_runs WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;
        Ok(running > 0)
    }

    /// Atomically create a `running` run iff none exists. `None` means another run holds admission.
    pub async fn try_acquire(&self, run_month: &str) -> StoreResult<Option<CrawlRun>> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let result = sqlx::query(
            r#"
INSERT INTO crawl_runs
  (id, run_month, status, started_at, total_papers, new_papers_count, created_at, updated_at)
SELECT ?1, ?2, 'running', ?3, 0, 0, ?3, ?3
WHERE NOT EXISTS (SELECT 1 FROM crawl_runs WHERE status = 'running')
"#,
        )
        .bind(id.to_string())
        .bind(run_month)
        .bind(ts(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                info!(run_id = %id, run_month, "admission granted");
                self.get_run(id).await.map(Some)
            }
            Ok(_) => {
                warn!(run_month, "admission denied: a run is already in progress");
                Ok(None)
            }
            Err(err) if is_unique_violation(&err) => {
                warn!(run_month, "admission denied by running-run index");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fail every `running` row started more than `max_age` ago. Such a row
    /// belongs to a process that died mid-run and would otherwise hold
    /// admission forever. Returns how many runs were expired.
    pub async fn expire_stale_runs(&self, max_age: Duration) -> StoreResult<u64> {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM crawl_runs WHERE status = 'running' AND started_at < ?1",
        )
        .bind(ts(cutoff))
        .fetch_all(&self.pool)
        .await?;

        let mut expired = 0;
        for id in stale {
            let run = self.fail_run(parse_uuid(&id)?, STALE_RUN_MESSAGE).await?;
            if run.error_message.as_deref() == Some(STALE_RUN_MESSAGE) {
                expired += 1;
            }
        }
        if expired > 0 {
            warn!(
                expired,
                max_age_seconds = max_age.as_secs(),
                "expired stale running runs"
            );
        }
        Ok(expired)
    }

    // ---- run lifecycle ---------------------------------------------------

    /// Create a run in `running` state. Performs no guarding beyond the schema's
    /// single-running index, which surfaces as [`StoreError::AlreadyRunning`].
    pub async fn start_run(&self, run_month: &str) -> StoreResult<CrawlRun> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let result = sqlx::query(
            r#"
INSERT INTO crawl_runs
  (id, run_month, status, started_at, total_papers, new_papers_count, created_at, updated_at)
VALUES (?1, ?2, 'running', ?3, 0, 0, ?3, ?3)
"#,
        )
        .bind(id.to_string())
        .bind(run_month)
        .bind(ts(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get_run(id).await,
            Err(err) if is_unique_violation(&err) => Err(StoreError::AlreadyRunning),
            Err(err) => Err(err.into()),
        }
    }

    /// `running -> completed`. No-op on a terminal run.
    pub async fn complete_run(
        &self,
        run_id: Uuid,
        completion: &RunCompletion,
    ) -> StoreResult<CrawlRun> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let finished_at = Utc::now();
        let hot_phrases = if completion.hot_phrases.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&completion.hot_phrases)?)
        };
        sqlx::query(
            r#"
UPDATE crawl_runs
SET status = 'completed',
    finished_at = ?2,
    duration_seconds = ?3,
    total_papers = ?4,
    new_papers_count = ?5,
    hot_phrases = ?6,
    log = ?7,
    updated_at = ?2
WHERE id = ?1 AND status = 'running'
"#,
        )
        .bind(run_id.to_string())
        .bind(ts(finished_at))
        .bind(elapsed_whole_seconds(run.started_at, finished_at))
        .bind(i64::from(completion.total_papers))
        .bind(i64::from(completion.new_papers_count))
        .bind(hot_phrases)
        .bind(completion.log.as_deref())
        .execute(&self.pool)
        .await?;

        let run = self.get_run(run_id).await?;
        info!(
            run_id = %run_id,
            total_papers = run.total_papers,
            new_papers = run.new_papers_count,
            duration_seconds = run.duration_seconds,
            "run completed"
        );
        Ok(run)
    }

    /// `running -> failed`. Papers committed by earlier batches are left in place.
    pub async fn fail_run(&self, run_id: Uuid, error_message: &str) -> StoreResult<CrawlRun> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let finished_at = Utc::now();
        sqlx::query(
            r#"
UPDATE crawl_runs
SET status = 'failed',
    finished_at = ?2,
    duration_seconds = ?3,
    error_message = ?4,
    updated_at = ?2
WHERE id = ?1 AND status = 'running'
"#,
        )
        .bind(run_id.to_string())
        .bind(ts(finished_at))
        .bind(elapsed_whole_seconds(run.started_at, finished_at))
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        warn!(run_id = %run_id, error_message, "run failed");
        self.get_run(run_id).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> StoreResult<CrawlRun> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM crawl_runs WHERE id = ?1"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("crawl run {run_id}")))?;
        row_to_run(&row)
    }

    pub async fn list_runs(&self, limit: u32) -> StoreResult<Vec<CrawlRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM crawl_runs ORDER BY started_at DESC LIMIT ?1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run).collect()
    }

    /// Administrative removal of a run record. Papers outlive it; their
    /// `crawl_run_id` is cleared by the foreign key.
    pub async fn delete_run(&self, run_id: Uuid) -> StoreResult<()> {
        let run = self.get_run(run_id).await?;
        if run.status == RunStatus::Running {
            return Err(StoreError::RunInProgress(run_id));
        }
        sqlx::query("DELETE FROM crawl_runs WHERE id = ?1")
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        info!(run_id = %run_id, "run deleted");
        Ok(())
    }

    // ---- paper store -----------------------------------------------------

    /// Merge a batch into the catalog in one transaction. Records without an
    /// arXiv id are dropped; repeated ids inside the batch collapse to the last one.
    pub async fn upsert_papers(
        &self,
        run_id: Uuid,
        records: &[RawPaper],
    ) -> StoreResult<UpsertCounts> {
        let mut order: Vec<String> = Vec::new();
        let mut rows: HashMap<String, NormalizedPaper> = HashMap::new();
        for row in records.iter().filter_map(RawPaper::normalize) {
            if !rows.contains_key(&row.arxiv_id) {
                order.push(row.arxiv_id.clone());
            }
            rows.insert(row.arxiv_id.clone(), row);
        }
        if order.is_empty() {
            return Ok(UpsertCounts::default());
        }

        let now = ts(Utc::now());
        let run_id_text = run_id.to_string();
        let mut counts = UpsertCounts::default();
        let mut tx = self.pool.begin().await?;
        for arxiv_id in &order {
            let Some(row) = rows.get(arxiv_id) else {
                continue;
            };
            let algorithm_phrase = row
                .algorithm_phrase
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let metadata = serde_json::to_string(&row.metadata)?;

            let observations: i64 = sqlx::query_scalar(UPSERT_PAPER_SQL)
                .bind(Uuid::new_v4().to_string())
                .bind(&row.arxiv_id)
                .bind(&run_id_text)
                .bind(row.title.as_deref())
                .bind(row.authors.as_deref())
                .bind(row.subjects.as_deref())
                .bind(row.abstract_text.as_deref())
                .bind(row.detail_title.as_deref())
                .bind(row.detail_dateline.as_deref())
                .bind(algorithm_phrase)
                .bind(metadata)
                .bind(&now)
                .bind(search_text(row))
                .fetch_one(&mut *tx)
                .await?;

            if observations == 1 {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }
        tx.commit().await?;

        info!(
            run_id = %run_id,
            inserted = counts.inserted,
            updated = counts.updated,
            skipped = records.len() - order.len(),
            "paper batch committed"
        );
        Ok(counts)
    }

    /// Newest-first page of papers; `keyword` matches title, abstract or arXiv id, case-insensitively.
    pub async fn list_papers(&self, query: &PaperQuery) -> StoreResult<PaperPage> {
        query.validate().map_err(StoreError::InvalidPage)?;

        let (filter, pattern) = match query.keyword() {
            Some(keyword) => (
                "WHERE search_text LIKE ?1 ESCAPE '\\'",
                like_pattern(keyword),
            ),
            // `?1` stays bound so both branches share parameter positions.
            None => ("WHERE ?1 IS NOT NULL", String::new()),
        };

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM papers {filter}"))
            .bind(&pattern)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(&format!(
            "SELECT {PAPER_COLUMNS} FROM papers {filter} \
             ORDER BY created_at DESC, arxiv_id DESC LIMIT ?2 OFFSET ?3"
        ))
        .bind(&pattern)
        .bind(i64::from(query.limit))
        .bind(i64::from(query.skip))
        .fetch_all(&self.pool)
        .await?;

        Ok(PaperPage {
            total: total.max(0) as u64,
            items: rows.iter().map(row_to_paper).collect::<StoreResult<_>>()?,
        })
    }

    pub async fn get_paper(&self, arxiv_id: &str) -> StoreResult<Paper> {
        let row = sqlx::query(&format!("SELECT {PAPER_COLUMNS} FROM papers WHERE arxiv_id = ?1"))
            .bind(arxiv_id.trim())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("paper {arxiv_id}")))?;
        row_to_paper(&row)
    }

    pub async fn latest_run(&self) -> StoreResult<CrawlRun> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM crawl_runs ORDER BY started_at DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("crawl run".to_string()))?;
        row_to_run(&row)
    }

    /// Latest run together with the papers it last touched.
    pub async fn latest_run_with_papers(&self) -> StoreResult<RunWithPapers> {
        let run = self.latest_run().await?;
        let rows = sqlx::query(&format!(
            "SELECT {PAPER_COLUMNS} FROM papers WHERE crawl_run_id = ?1 \
             ORDER BY created_at DESC, arxiv_id DESC"
        ))
        .bind(run.id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let papers = rows.iter().map(row_to_paper).collect::<StoreResult<_>>()?;
        Ok(RunWithPapers { run, papers })
    }

    /// Hot phrases of the most recent run that recorded any, truncated to `limit`.
    pub async fn list_hot_phrases(&self, limit: usize) -> StoreResult<Vec<String>> {
        let json: Option<String> = sqlx::query_scalar(
            r#"
SELECT hot_phrases FROM crawl_runs
WHERE hot_phrases IS NOT NULL AND hot_phrases != '[]'
ORDER BY started_at DESC
LIMIT 1
"#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let mut phrases: Vec<String> = match json {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        phrases.truncate(limit);
        Ok(phrases)
    }
}

// ---- HTTP fetch utilities ------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
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
    pub max_concurrency: usize,
    /// Minimum spacing between request starts; arXiv asks crawlers to pace themselves.
    pub min_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_concurrency: 4,
            min_interval: Duration::from_millis(250),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Spaces request starts at least `interval` apart across all callers.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let wait_until = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(wait_until.into()).await;
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
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
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            pacer: RequestPacer::new(config.min_interval),
            backoff: config.backoff,
        })
    }

    /// GET `url` as text, retrying transient failures with exponential backoff.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            self.pacer.wait_turn().await;
            let retry = attempt < self.backoff.max_retries;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if retry && classify_status(status) == RetryDisposition::Retryable {
                        warn!(status = status.as_u16(), attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if retry && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        warn!(error = %err, attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use papersync_core::{AuthorList, PhraseList};
    use tempfile::tempdir;

    fn paper(id: &str, title: &str) -> RawPaper {
        RawPaper {
            title: Some(title.to_string()),
            abstract_text: Some(format!("Abstract of {title}")),
            authors: Some(AuthorList::Names(vec!["A. Author".into(), "B. Author".into()])),
            ..RawPaper::with_id(id)
        }
    }

    async fn catalog() -> Catalog {
        Catalog::in_memory().await.expect("in-memory catalog")
    }

    #[tokio::test]
    async fn repeated_runs_keep_one_row_per_arxiv_id() {
        let catalog = catalog().await;

        let r1 = catalog.start_run("2024-05").await.unwrap();
        let first = catalog
            .upsert_papers(
                r1.id,
                &[paper("A1", "One"), paper("A2", "Two"), paper("A3", "Three")],
            )
            .await
            .unwrap();
        assert_eq!(first, UpsertCounts { inserted: 3, updated: 0 });
        catalog
            .complete_run(
                r1.id,
                &RunCompletion {
                    total_papers: first.total() as u32,
                    new_papers_count: first.inserted as u32,
                    ..RunCompletion::default()
                },
            )
            .await
            .unwrap();
        let a1_before = catalog.get_paper("A1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        let r2 = catalog.start_run("2024-06").await.unwrap();
        let second = catalog
            .upsert_papers(r2.id, &[paper("A1", "One, revised"), paper("A4", "Four")])
            .await
            .unwrap();
        assert_eq!(second, UpsertCounts { inserted: 1, updated: 1 });

        let a1 = catalog.get_paper("A1").await.unwrap();
        assert_eq!(a1.id, a1_before.id);
        assert_eq!(a1.title.as_deref(), Some("One, revised"));
        assert_eq!(a1.crawl_run_id, Some(r2.id));
        assert_eq!(a1.created_at, a1_before.created_at);
        assert!(a1.updated_at > a1_before.updated_at);
        assert_eq!(a1.observation_count, 2);

        let a4 = catalog.get_paper("A4").await.unwrap();
        assert_eq!(a4.crawl_run_id, Some(r2.id));

        let all = catalog.list_papers(&PaperQuery::default()).await.unwrap();
        assert_eq!(all.total, 4);
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let catalog = catalog().await;
        let run = catalog.start_run("2024-05").await.unwrap();
        let counts = catalog.upsert_papers(run.id, &[]).await.unwrap();
        assert_eq!(counts, UpsertCounts::default());
        let page = catalog.list_papers(&PaperQuery::default()).await.unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn unkeyed_records_are_dropped_and_duplicates_collapse() {
        let catalog = catalog().await;
        let run = catalog.start_run("2024-05").await.unwrap();
        let records = vec![
            RawPaper::default(),
            RawPaper::with_id("  "),
            paper("B1", "first title"),
            paper("B1", "last title"),
        ];
        let counts = catalog.upsert_papers(run.id, &records).await.unwrap();
        assert_eq!(counts, UpsertCounts { inserted: 1, updated: 0 });
        assert_eq!(
            catalog.get_paper("B1").await.unwrap().title.as_deref(),
            Some("last title")
        );
    }

    #[tokio::test]
    async fn stored_fields_are_normalized() {
        let catalog = catalog().await;
        let run = catalog.start_run("2024-05").await.unwrap();
        let record = RawPaper {
            algorithm_phrase: Some(PhraseList::One("mixture of experts".into())),
            pdf_url: Some("https://arxiv.org/pdf/C1".into()),
            comments: Some(String::new()),
            ..paper("C1", "Routing")
        };
        catalog.upsert_papers(run.id, &[record]).await.unwrap();

        let stored = catalog.get_paper("C1").await.unwrap();
        assert_eq!(stored.authors.as_deref(), Some("A. Author, B. Author"));
        assert_eq!(stored.algorithm_phrase, vec!["mixture of experts"]);
        assert_eq!(stored.metadata.len(), 1);
        assert!(stored.metadata.contains_key("pdf_url"));
    }

    #[tokio::test]
    async fn keyword_search_filters_and_counts_before_paging() {
        let catalog = catalog().await;
        let run = catalog.start_run("2024-05").await.unwrap();
        let mut records = Vec::new();
        for i in 0..5 {
            records.push(paper(&format!("N{i}"), &format!("Deep NEURAL model {i}")));
        }
        for i in 0..10 {
            records.push(paper(&format!("X{i}"), &format!("Symbolic planner {i}")));
        }
        catalog.upsert_papers(run.id, &records).await.unwrap();

        let page = catalog
            .list_papers(&PaperQuery::new(0, 2, Some("neural".into())))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page
            .items
            .iter()
            .all(|p| p.title.as_deref().unwrap_or_default().to_lowercase().contains("neural")));

        let by_id = catalog
            .list_papers(&PaperQuery::new(0, 20, Some("x3".into())))
            .await
            .unwrap();
        assert_eq!(by_id.total, 1);
        assert_eq!(by_id.items[0].arxiv_id, "X3");

        let wildcard = catalog
            .list_papers(&PaperQuery::new(0, 20, Some("%".into())))
            .await
            .unwrap();
        assert_eq!(wildcard.total, 0);

        let tail = catalog
            .list_papers(&PaperQuery::new(14, 20, None))
            .await
            .unwrap();
        assert_eq!(tail.total, 15);
        assert_eq!(tail.items.len(), 1);
    }

    #[tokio::test]
    async fn keyword_search_folds_non_ascii_case() {
        let catalog = catalog().await;
        let run = catalog.start_run("2024-05").await.unwrap();
        let records = [
            paper("U1", "\u{00C9}tude of Transformers"),
            RawPaper {
                abstract_text: Some("Über die Grenzen der Aufmerksamkeit".into()),
                ..paper("U2", "Attention limits")
            },
            paper("U3", "Plain ascii title"),
        ];
        catalog.upsert_papers(run.id, &records).await.unwrap();

        for keyword in ["Étude", "étude", "ÉTUDE", "étude of"] {
            let page = catalog
                .list_papers(&PaperQuery::new(0, 20, Some(keyword.into())))
                .await
                .unwrap();
            assert_eq!(page.total, 1, "keyword {keyword:?}");
            assert_eq!(page.items[0].arxiv_id, "U1");
            assert_eq!(
                page.items[0].title.as_deref(),
                Some("\u{00C9}tude of Transformers")
            );
        }

        let abstract_hit = catalog
            .list_papers(&PaperQuery::new(0, 20, Some("über".into())))
            .await
            .unwrap();
        assert_eq!(abstract_hit.total, 1);
        assert_eq!(abstract_hit.items[0].arxiv_id, "U2");

        let across_fields = catalog
            .list_papers(&PaperQuery::new(0, 20, Some("u3 plain".into())))
            .await
            .unwrap();
        assert_eq!(across_fields.total, 0);
    }

    #[tokio::test]
    async fn invalid_page_is_rejected() {
        let catalog = catalog().await;
        let err = catalog
            .list_papers(&PaperQuery::new(0, 101, None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPage(_)));
    }

    #[tokio::test]
    async fn latest_run_on_empty_catalog_is_not_found() {
        let catalog = catalog().await;
        assert!(matches!(
            catalog.latest_run().await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            catalog.latest_run_with_papers().await,
            Err(StoreError::NotFound(_))
        ));
        assert!(catalog.list_hot_phrases(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admission_is_single_flight() {
        let catalog = catalog().await;
        assert!(!catalog.is_running().await.unwrap());

        let first = catalog.try_acquire("2024-05").await.unwrap();
        assert!(first.is_some());
        assert!(catalog.is_running().await.unwrap());
        assert!(catalog.try_acquire("2024-06").await.unwrap().is_none());
        assert!(matches!(
            catalog.start_run("2024-06").await,
            Err(StoreError::AlreadyRunning)
        ));
        assert_eq!(catalog.list_runs(10).await.unwrap().len(), 1);

        let run = first.unwrap();
        catalog.fail_run(run.id, "boom").await.unwrap();
        assert!(!catalog.is_running().await.unwrap());
        assert!(catalog.try_acquire("2024-06").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_acquire_on_shared_file_grants_exactly_one() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("catalog.db").display());
        let a = Catalog::connect(&url).await.unwrap();
        let b = Catalog::connect(&url).await.unwrap();

        let (ra, rb) = tokio::join!(a.try_acquire("2024-05"), b.try_acquire("2024-05"));
        let granted = [ra.unwrap(), rb.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(granted, 1);
        assert_eq!(a.list_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_running_row_from_dead_process_is_expired() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("catalog.db").display());

        let a = Catalog::connect(&url).await.unwrap();
        let orphan = a.try_acquire("2024-05").await.unwrap().expect("admitted");
        a.pool().close().await;
        drop(a);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let b = Catalog::connect(&url).await.unwrap();
        assert!(b.try_acquire("2024-05").await.unwrap().is_none());
        assert!(matches!(
            b.delete_run(orphan.id).await,
            Err(StoreError::RunInProgress(_))
        ));

        // A run younger than the timeout is left alone.
        assert_eq!(b.expire_stale_runs(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(b.is_running().await.unwrap());

        assert_eq!(b.expire_stale_runs(Duration::from_millis(10)).await.unwrap(), 1);
        let expired = b.get_run(orphan.id).await.unwrap();
        assert_eq!(expired.status, RunStatus::Failed);
        assert_eq!(expired.error_message.as_deref(), Some(STALE_RUN_MESSAGE));
        assert!(expired.finished_at.is_some());

        let next = b.try_acquire("2024-06").await.unwrap();
        assert!(next.is_some());
        assert_eq!(b.expire_stale_runs(Duration::from_secs(3600)).await.unwrap(), 0);
        b.delete_run(orphan.id).await.unwrap();
    }

    #[tokio::test]
    async fn completion_records_outcome_and_is_terminal() {
        let catalog = catalog().await;
        let run = catalog.start_run("2024-05").await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        let done = catalog
            .complete_run(
                run.id,
                &RunCompletion {
                    total_papers: 7,
                    new_papers_count: 3,
                    hot_phrases: vec!["agents".into(), "diffusion".into()],
                    log: Some("new_papers=3".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.total_papers, 7);
        assert_eq!(done.new_papers_count, 3);
        assert_eq!(done.duration_seconds, Some(0));
        assert!(done.finished_at.is_some());
        assert!(done.error_message.is_none());

        let again = catalog
            .complete_run(run.id, &RunCompletion::default())
            .await
            .unwrap();
        assert_eq!(again, done);
        let after_fail = catalog.fail_run(run.id, "late failure").await.unwrap();
        assert_eq!(after_fail.status, RunStatus::Completed);
        assert!(after_fail.error_message.is_none());
    }

    #[tokio::test]
    async fn failed_run_keeps_committed_batches() {
        let catalog = catalog().await;
        let run = catalog.try_acquire("2024-05").await.unwrap().unwrap();
        catalog
            .upsert_papers(run.id, &[paper("P1", "kept"), paper("P2", "kept too")])
            .await
            .unwrap();

        let failed = catalog.fail_run(run.id, "store went away").await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("store went away"));
        assert!(failed.finished_at.is_some());
        assert!(failed.duration_seconds.is_some());

        let page = catalog.list_papers(&PaperQuery::default()).await.unwrap();
        assert_eq!(page.total, 2);
        let latest = catalog.latest_run_with_papers().await.unwrap();
        assert_eq!(latest.run.id, run.id);
        assert_eq!(latest.papers.len(), 2);
    }

    #[tokio::test]
    async fn hot_phrases_come_from_latest_run_that_has_them() {
        let catalog = catalog().await;
        let older = catalog.start_run("2024-04").await.unwrap();
        catalog
            .complete_run(
                older.id,
                &RunCompletion {
                    hot_phrases: vec!["a".into(), "b".into(), "c".into()],
                    ..RunCompletion::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let newer = catalog.start_run("2024-05").await.unwrap();
        catalog
            .complete_run(newer.id, &RunCompletion::default())
            .await
            .unwrap();

        assert_eq!(catalog.list_hot_phrases(2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(catalog.latest_run().await.unwrap().id, newer.id);
    }

    #[tokio::test]
    async fn deleting_a_run_leaves_its_papers() {
        let catalog = catalog().await;
        let run = catalog.start_run("2024-05").await.unwrap();
        catalog
            .upsert_papers(run.id, &[paper("D1", "durable")])
            .await
            .unwrap();
        assert!(matches!(
            catalog.delete_run(run.id).await,
            Err(StoreError::RunInProgress(_))
        ));

        catalog
            .complete_run(run.id, &RunCompletion::default())
            .await
            .unwrap();
        catalog.delete_run(run.id).await.unwrap();

        let survivor = catalog.get_paper("D1").await.unwrap();
        assert_eq!(survivor.crawl_run_id, None);
        assert!(matches!(
            catalog.delete_run(run.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("Neural"), "%neural%");
        assert_eq!(like_pattern("50%_a\\b"), "%50\\%\\_a\\\\b%");
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = a + chrono::Duration::microseconds(1500);
        assert_eq!(ts(a), "2026-02-24T12:00:00.000000Z");
        assert!(ts(a) < ts(b));
        assert_eq!(parse_ts(&ts(b)).unwrap(), b);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn pacer_spaces_request_starts() {
        let pacer = RequestPacer::new(Duration::from_millis(20));
        let started = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
