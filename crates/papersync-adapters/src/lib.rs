//! Collaborator seams for the sync driver plus the arXiv listing adapter.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use papersync_core::{AuthorList, PaperDetail, RawPaper};
use papersync_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "papersync-adapters";

pub const ARXIV_ORIGIN: &str = "https://arxiv.org";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces raw paper records for a period.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Whether the driver should run the per-paper detail pass.
    fn wants_details(&self) -> bool {
        true
    }

    async fn fetch_listing(&self, run_month: &str) -> Result<Vec<RawPaper>, AdapterError>;

    /// Richer per-paper fields. `Ok(None)` when the record has nothing to look up.
    async fn fetch_detail(&self, paper: &RawPaper) -> Result<Option<PaperDetail>, AdapterError>;
}

/// Produces candidate phrases for one paper.
pub trait PhraseExtractor: Send + Sync {
    fn extract(&self, paper: &RawPaper) -> Result<Vec<String>, AdapterError>;
}

/// Keeps whatever phrases the source already attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPhraseExtractor;

impl PhraseExtractor for PassthroughPhraseExtractor {
    fn extract(&self, paper: &RawPaper) -> Result<Vec<String>, AdapterError> {
        Ok(paper.phrases())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingConfig {
    /// Listing URL; `{period}` is replaced with the run month (e.g. `/list/cs.AI/{period}`).
    pub base_url: String,
    pub max_papers: usize,
    pub page_size: usize,
    pub fetch_details: bool,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            base_url: format!("{ARXIV_ORIGIN}/list/cs.AI/recent"),
            max_papers: 300,
            page_size: 50,
            fetch_details: true,
        }
    }
}

impl ListingConfig {
    pub fn page_count(&self) -> usize {
        self.max_papers.div_ceil(self.page_size.max(1))
    }

    pub fn page_url(&self, run_month: &str, page_index: usize) -> String {
        let base = self.base_url.replace("{period}", run_month);
        let sep = if base.contains('?') { '&' } else { '?' };
        let page_size = self.page_size.max(1);
        format!(
            "{base}{sep}skip={}&show={page_size}",
            page_index * page_size
        )
    }
}

/// Live arXiv listing + abstract-page fetcher.
#[derive(Debug)]
pub struct ArxivListingFetcher {
    http: HttpFetcher,
    config: ListingConfig,
}

impl ArxivListingFetcher {
    pub fn new(http: HttpFetcher, config: ListingConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &ListingConfig {
        &self.config
    }
}

#[async_trait]
impl SourceFetcher for ArxivListingFetcher {
    fn source_id(&self) -> &'static str {
        "arxiv"
    }

    fn wants_details(&self) -> bool {
        self.config.fetch_details
    }

    async fn fetch_listing(&self, run_month: &str) -> Result<Vec<RawPaper>, AdapterError> {
        let mut papers = Vec::new();
        let mut seen = HashSet::new();
        let mut considered = 0usize;

        for page in 0..self.config.page_count() {
            let url = self.config.page_url(run_month, page);
            let html = match self.http.fetch_text(&url).await {
                Ok(html) => html,
                Err(err) if papers.is_empty() => return Err(err.into()),
                Err(err) => {
                    warn!(%url, error = %err, "listing page failed; keeping earlier pages");
                    break;
                }
            };

            let entries = parse_listing_page(&html)?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                if considered >= self.config.max_papers {
                    break;
                }
                considered += 1;
                if let Some(key) = entry.key() {
                    if !seen.insert(key.to_string()) {
                        continue;
                    }
                }
                papers.push(entry);
            }
            if considered >= self.config.max_papers {
                break;
            }
        }

        info!(run_month, considered, kept = papers.len(), "arxiv listing fetched");
        Ok(papers)
    }

    async fn fetch_detail(&self, paper: &RawPaper) -> Result<Option<PaperDetail>, AdapterError> {
        let Some(url) = paper.arxiv_url.as_deref() else {
            return Ok(None);
        };
        let html = self.http.fetch_text(url).await?;
        Ok(Some(parse_detail_page(&html, Utc::now())?))
    }
}

/// Listing + details read from a JSON file instead of the network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureListing {
    pub papers: Vec<RawPaper>,
    #[serde(default)]
    pub details: BTreeMap<String, PaperDetail>,
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    listing: FixtureListing,
}

impl FixtureSource {
    pub fn new(listing: FixtureListing) -> Self {
        Self { listing }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let listing = serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(listing))
    }
}

#[async_trait]
impl SourceFetcher for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    fn wants_details(&self) -> bool {
        !self.listing.details.is_empty()
    }

    async fn fetch_listing(&self, _run_month: &str) -> Result<Vec<RawPaper>, AdapterError> {
        Ok(self.listing.papers.clone())
    }

    async fn fetch_detail(&self, paper: &RawPaper) -> Result<Option<PaperDetail>, AdapterError> {
        Ok(paper
            .key()
            .and_then(|key| self.listing.details.get(key))
            .cloned())
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("bad selector {css:?}: {e}")))
}

/// Whitespace-collapsed text, `None` when blank.
fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn strip_label(text: String, label: &str) -> Option<String> {
    let stripped = text.strip_prefix(label).unwrap_or(&text).trim().to_string();
    text_or_none(stripped)
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn all_texts(scope: ElementRef<'_>, sel: &Selector) -> Vec<String> {
    scope
        .select(sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect()
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn absolute_url(href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{ARXIV_ORIGIN}/{}", href.trim_start_matches('/'))
    }
}

/// Parse one listing page: each entry is a `<dt>` (links) followed by a `<dd>` (metadata).
pub fn parse_listing_page(html: &str) -> Result<Vec<RawPaper>, AdapterError> {
    let document = Html::parse_document(html);
    let dt_sel = selector("dt")?;
    let dd_sel = selector("dd")?;
    let abstract_link = selector(r#"a[title="Abstract"]"#)?;
    let pdf_link = selector(r#"a[title="Download PDF"]"#)?;
    let title_sel = selector("div.list-title")?;
    let authors_sel = selector("div.list-authors a")?;
    let subjects_sel = selector("div.list-subjects")?;
    let comments_sel = selector("div.list-comments")?;
    let journal_sel = selector("div.list-journal-ref")?;

    let root = document.root_element();
    let papers = root
        .select(&dt_sel)
        .zip(root.select(&dd_sel))
        .map(|(dt, dd)| {
            let arxiv_id = first_text(dt, &abstract_link)
                .map(|id| id.trim_start_matches("arXiv:").trim().to_string())
                .filter(|id| !id.is_empty());
            let authors = all_texts(dd, &authors_sel);
            RawPaper {
                arxiv_url: arxiv_id
                    .as_ref()
                    .map(|id| format!("{ARXIV_ORIGIN}/abs/{id}")),
                pdf_url: first_attr(dt, &pdf_link, "href").map(|href| absolute_url(&href)),
                title: first_text(dd, &title_sel).and_then(|t| strip_label(t, "Title:")),
                authors: (!authors.is_empty()).then_some(AuthorList::Names(authors)),
                subjects: first_text(dd, &subjects_sel).and_then(|t| strip_label(t, "Subjects:")),
                comments: first_text(dd, &comments_sel).and_then(|t| strip_label(t, "Comments:")),
                journal_ref: first_text(dd, &journal_sel)
                    .and_then(|t| strip_label(t, "Journal-ref:")),
                arxiv_id,
                ..RawPaper::default()
            }
        })
        .collect();
    Ok(papers)
}

/// Parse an abstract page into detail fields.
pub fn parse_detail_page(html: &str, fetched_at: DateTime<Utc>) -> Result<PaperDetail, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    Ok(PaperDetail {
        detail_title: first_text(root, &selector("h1.title")?)
            .and_then(|t| strip_label(t, "Title:")),
        abstract_text: first_text(root, &selector("blockquote.abstract")?)
            .and_then(|t| strip_label(t, "Abstract:")),
        detail_dateline: first_text(root, &selector("div.dateline")?),
        fetched_at: Some(fetched_at),
    })
}
