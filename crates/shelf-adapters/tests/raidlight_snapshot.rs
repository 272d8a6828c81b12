// Golden snapshot for the first saved Raidlight listing page.

use std::path::{Path, PathBuf};

use shelf_adapters::{parse_listing_html, StorefrontProfile};
use shelf_core::RawRecord;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/raidlight")
}

#[test]
fn raidlight_page_one_matches_golden_snapshot() {
    let profile = StorefrontProfile::default();
    let html = std::fs::read_to_string(fixture_dir().join("page-1.html")).expect("read page-1.html");
    let actual = parse_listing_html(&profile, &html, &profile.page_url(1).unwrap()).unwrap();

    let snapshot = std::fs::read_to_string(fixture_dir().join("snapshot.json")).expect("read snapshot");
    let expected: Vec<RawRecord> = serde_json::from_str(&snapshot).expect("parse snapshot");
    assert_eq!(actual, expected);
}
