use std::fs;
use std::path::{Path, PathBuf};

use knb_adapters::{BoardAdapter, BoardExtractor, FixtureBoardAdapter, KANGNAM_BOARD_ID};
use knb_core::{CandidateEntry, DEFAULT_BASE_ORIGIN};

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/kangnam")
        .canonicalize()
        .expect("fixtures dir")
}

fn read_fixture(name: &str) -> String {
    fs::read_to_string(fixtures_dir().join(name)).expect("read fixture")
}

fn read_snapshot(name: &str) -> Vec<CandidateEntry> {
    serde_json::from_str(&read_fixture(name)).expect("parse snapshot")
}

fn extractor() -> BoardExtractor {
    BoardExtractor::kangnam(DEFAULT_BASE_ORIGIN).expect("kangnam extractor")
}

#[test]
fn golden_snapshot_primary_markup() {
    let actual = extractor().extract(&read_fixture("primary.html"));
    assert_eq!(actual, read_snapshot("primary.snapshot.json"));
}

#[test]
fn golden_snapshot_secondary_markup_via_fallback() {
    let actual = extractor().extract(&read_fixture("secondary.html"));
    assert_eq!(actual, read_snapshot("secondary.snapshot.json"));
}

#[test]
fn placeholder_only_board_yields_nothing_and_does_not_fall_back() {
    // The page also carries a `.c-board-list` quick-link menu; it must not be
    // consulted because the primary rows matched before filtering.
    let actual = extractor().extract(&read_fixture("placeholder.html"));
    assert!(actual.is_empty(), "unexpected candidates: {actual:?}");
}

#[test]
fn unrecognised_markup_yields_nothing() {
    assert!(extractor().extract(&read_fixture("empty.html")).is_empty());
}

#[tokio::test]
async fn fixture_adapter_round_trips_through_fetch_and_parse() {
    let adapter = FixtureBoardAdapter::new(fixtures_dir().join("secondary.html"), DEFAULT_BASE_ORIGIN)
        .expect("adapter");
    assert_eq!(adapter.board_id(), KANGNAM_BOARD_ID);

    let page = adapter.fetch_listing().await.expect("fetch fixture");
    assert!(page.url.ends_with("secondary.html"));
    let drafts = adapter.parse_listing(&page);
    assert_eq!(drafts, read_snapshot("secondary.snapshot.json"));
}
