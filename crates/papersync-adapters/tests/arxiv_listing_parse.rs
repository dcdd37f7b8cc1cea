use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use papersync_adapters::{parse_detail_page, parse_listing_page, FixtureSource, SourceFetcher};
use papersync_core::AuthorList;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/arxiv/sample")
        .join(name)
}

fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixture(name)).expect("fixture readable")
}

#[test]
fn listing_page_yields_one_record_per_entry() {
    let papers = parse_listing_page(&read_fixture("listing.html")).unwrap();
    assert_eq!(papers.len(), 3);

    let first = &papers[0];
    assert_eq!(first.key(), Some("2405.01001"));
    assert_eq!(
        first.title.as_deref(),
        Some("Sparse Mixture of Experts for Long-Context Retrieval")
    );
    assert_eq!(
        first.authors,
        Some(AuthorList::Names(vec!["Ada Lovelace".into(), "Alan Turing".into()]))
    );
    assert_eq!(
        first.subjects.as_deref(),
        Some("Artificial Intelligence (cs.AI); Machine Learning (cs.LG)")
    );
    assert_eq!(first.comments.as_deref(), Some("12 pages, 4 figures"));
    assert_eq!(first.arxiv_url.as_deref(), Some("https://arxiv.org/abs/2405.01001"));
    assert_eq!(first.pdf_url.as_deref(), Some("https://arxiv.org/pdf/2405.01001"));

    assert_eq!(papers[1].journal_ref.as_deref(), Some("NeurIPS 2024"));
    assert_eq!(papers[1].comments, None);

    let unkeyed = &papers[2];
    assert_eq!(unkeyed.key(), None);
    assert_eq!(unkeyed.arxiv_url, None);
    assert_eq!(unkeyed.title.as_deref(), Some("Entry Without Identifier"));
}

#[test]
fn detail_page_strips_descriptors() {
    let at = Utc.with_ymd_and_hms(2024, 5, 3, 8, 0, 0).single().unwrap();
    let detail = parse_detail_page(&read_fixture("detail.html"), at).unwrap();
    assert_eq!(
        detail.detail_title.as_deref(),
        Some("Sparse Mixture of Experts for Long-Context Retrieval")
    );
    let abstract_text = detail.abstract_text.unwrap();
    assert!(abstract_text.starts_with("We route long documents"));
    assert!(!abstract_text.contains('\n'));
    assert_eq!(
        detail.detail_dateline.as_deref(),
        Some("[Submitted on 1 May 2024 (v1), last revised 2 May 2024 (this version, v2)]")
    );
    assert_eq!(detail.fetched_at, Some(at));
}

#[test]
fn empty_listing_parses_to_nothing() {
    let papers = parse_listing_page("<html><body><dl></dl></body></html>").unwrap();
    assert!(papers.is_empty());
}

#[tokio::test]
async fn fixture_bundle_matches_parsed_listing() {
    let source = FixtureSource::load(fixture("papers.json")).unwrap();
    let bundled = source.fetch_listing("2024-05").await.unwrap();
    let parsed = parse_listing_page(&read_fixture("listing.html")).unwrap();

    let bundled_ids: Vec<_> = bundled.iter().map(|p| p.key()).collect();
    let parsed_ids: Vec<_> = parsed.iter().map(|p| p.key()).collect();
    assert_eq!(bundled_ids, parsed_ids);

    let detail = source.fetch_detail(&bundled[0]).await.unwrap().unwrap();
    let parsed_detail = parse_detail_page(
        &read_fixture("detail.html"),
        detail.fetched_at.expect("fixture carries fetch time"),
    )
    .unwrap();
    assert_eq!(detail, parsed_detail);
}
