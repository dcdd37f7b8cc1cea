//! Core domain model for the monthly arXiv catalog sync.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "papersync-core";

/// Maximum number of phrases kept on a run's `hot_phrases`.
pub const HOT_PHRASE_LIMIT: usize = 5;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Metadata keys lifted off a raw record, in the order they are collected.
pub const METADATA_KEYS: [&str; 5] = [
    "arxiv_url",
    "pdf_url",
    "comments",
    "journal_ref",
    "detail_fetched_at",
];

/// Authors as delivered by a source: either a list of names or an already flattened string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthorList {
    Names(Vec<String>),
    Flat(String),
}

impl AuthorList {
    pub fn display(&self) -> String {
        match self {
            Self::Names(names) => names
                .iter()
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
            Self::Flat(flat) => flat.trim().to_string(),
        }
    }
}

/// Extracted phrases: a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhraseList {
    Many(Vec<String>),
    One(String),
}

impl PhraseList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

/// Listing entry as produced by a source fetcher, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPaper {
    #[serde(default)]
    pub arxiv_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Option<AuthorList>,
    #[serde(default)]
    pub subjects: Option<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub detail_title: Option<String>,
    #[serde(default)]
    pub detail_dateline: Option<String>,
    #[serde(default)]
    pub algorithm_phrase: Option<PhraseList>,
    #[serde(default)]
    pub arxiv_url: Option<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub journal_ref: Option<String>,
    #[serde(default)]
    pub detail_fetched_at: Option<String>,
}

/// Fields recovered from a paper's abstract page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperDetail {
    pub detail_title: Option<String>,
    pub abstract_text: Option<String>,
    pub detail_dateline: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl RawPaper {
    pub fn with_id(arxiv_id: impl Into<String>) -> Self {
        Self {
            arxiv_id: Some(arxiv_id.into()),
            ..Self::default()
        }
    }

    /// Trimmed natural key, or `None` when the record cannot be keyed.
    pub fn key(&self) -> Option<&str> {
        self.arxiv_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Overlay detail-page fields; absent detail values leave the listing values in place.
    pub fn apply_detail(&mut self, detail: PaperDetail) {
        if let Some(value) = non_empty(detail.detail_title) {
            self.detail_title = Some(value);
        }
        if let Some(value) = non_empty(detail.abstract_text) {
            self.abstract_text = Some(value);
        }
        if let Some(value) = non_empty(detail.detail_dateline) {
            self.detail_dateline = Some(value);
        }
        if let Some(at) = detail.fetched_at {
            self.detail_fetched_at = Some(at.to_rfc3339());
        }
    }

    /// Phrases currently attached to the record, trimmed and without blanks.
    pub fn phrases(&self) -> Vec<String> {
        self.algorithm_phrase
            .clone()
            .map(PhraseList::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Text the phrase extractor looks at.
    pub fn searchable_text(&self) -> String {
        [
            self.title.as_deref(),
            self.detail_title.as_deref(),
            self.abstract_text.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("\n")
    }

    /// Flatten into the row shape written by the catalog. `None` for records without a key.
    pub fn normalize(&self) -> Option<NormalizedPaper> {
        let arxiv_id = self.key()?.to_string();

        let mut metadata = BTreeMap::new();
        let aux = [
            &self.arxiv_url,
            &self.pdf_url,
            &self.comments,
            &self.journal_ref,
            &self.detail_fetched_at,
        ];
        for (key, value) in METADATA_KEYS.iter().zip(aux) {
            if let Some(value) = non_empty(value.clone()) {
                metadata.insert((*key).to_string(), value);
            }
        }

        Some(NormalizedPaper {
            arxiv_id,
            title: self.title.clone(),
            authors: self.authors.as_ref().map(AuthorList::display),
            subjects: self.subjects.clone(),
            abstract_text: self.abstract_text.clone(),
            detail_title: self.detail_title.clone(),
            detail_dateline: self.detail_dateline.clone(),
            algorithm_phrase: self.algorithm_phrase.clone().map(PhraseList::into_vec),
            metadata,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Row payload for one paper upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedPaper {
    pub arxiv_id: String,
    pub title: Option<String>,
    pub authors: Option<String>,
    pub subjects: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub detail_title: Option<String>,
    pub detail_dateline: Option<String>,
    pub algorithm_phrase: Option<Vec<String>>,
    pub metadata: BTreeMap<String, String>,
}

/// Persisted catalog entry, one per arXiv identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paper {
    pub id: Uuid,
    pub arxiv_id: String,
    /// Run that last created or updated the row. Cleared if that run is deleted.
    pub crawl_run_id: Option<Uuid>,
    pub title: Option<String>,
    pub authors: Option<String>,
    pub subjects: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub detail_title: Option<String>,
    pub detail_dateline: Option<String>,
    pub algorithm_phrase: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub observation_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One synchronization attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlRun {
    pub id: Uuid,
    pub run_month: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub total_papers: u32,
    pub new_papers_count: u32,
    pub hot_phrases: Vec<String>,
    pub error_message: Option<String>,
    pub log: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Latest-run view: the run plus the papers it last touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWithPapers {
    #[serde(flatten)]
    pub run: CrawlRun,
    pub papers: Vec<Paper>,
}

/// Terminal outcome handed to the lifecycle manager on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCompletion {
    pub total_papers: u32,
    pub new_papers_count: u32,
    pub hot_phrases: Vec<String>,
    pub log: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertCounts {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

impl std::ops::AddAssign for UpsertCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

/// Paging + keyword filter for paper listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperQuery {
    pub skip: u32,
    pub limit: u32,
    pub keyword: Option<String>,
}

impl Default for PaperQuery {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_PAGE_SIZE,
            keyword: None,
        }
    }
}

impl PaperQuery {
    pub fn new(skip: u32, limit: u32, keyword: Option<String>) -> Self {
        Self {
            skip,
            limit,
            keyword,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.limit == 0 || self.limit > MAX_PAGE_SIZE {
            return Err(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.limit
            ));
        }
        Ok(())
    }

    /// Keyword with surrounding whitespace removed; blank keywords disable filtering.
    pub fn keyword(&self) -> Option<&str> {
        self.keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperPage {
    pub total: u64,
    pub items: Vec<Paper>,
}

/// Rank phrases across a run. Each phrase counts once per paper; ties break
/// lexicographically ascending.
pub fn rank_hot_phrases<I, P>(phrases_per_paper: I, top_n: usize) -> Vec<String>
where
    I: IntoIterator<Item = P>,
    P: IntoIterator<Item = String>,
{
    let mut counts: HashMap<String, usize> = HashMap::new();
    for paper_phrases in phrases_per_paper {
        let distinct: BTreeSet<String> = paper_phrases
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        for phrase in distinct {
            *counts.entry(phrase).or_default() += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|(pa, ca), (pb, cb)| cb.cmp(ca).then_with(|| pa.cmp(pb)));
    ranked.into_iter().take(top_n).map(|(p, _)| p).collect()
}

/// Calendar period label, e.g. `2024-05`.
pub fn run_month_for(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Whole seconds elapsed, floored, never negative.
pub fn elapsed_whole_seconds(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> i64 {
    (finished_at - started_at).num_seconds().max(0)
}
