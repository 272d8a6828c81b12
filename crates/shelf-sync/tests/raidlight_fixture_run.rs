// End-to-end assembly over the saved Raidlight listing pages.

use std::path::{Path, PathBuf};

use shelf_adapters::{FixturePageExtractor, StorefrontProfile};
use shelf_sync::{CatalogAssembler, StopReason};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/raidlight")
}

fn assembler() -> CatalogAssembler<FixturePageExtractor> {
    let extractor = FixturePageExtractor::new(fixture_dir(), StorefrontProfile::default())
        .expect("default profile is valid");
    CatalogAssembler::new(extractor)
}

#[tokio::test]
async fn repeated_third_page_ends_the_run() {
    let catalog = assembler().assemble(100).await.expect("assemble");

    let urls: Vec<_> = catalog.records.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://raidlight.com/collections/all/products/responsiv-vest-12l",
            "https://raidlight.com/products/ultralight-jacket",
            "https://raidlight.com/products/revolutiv-shoes",
            "https://raidlight.com/products/trail-bottle-600ml",
            "https://raidlight.com/products/winter-trail-gloves",
        ]
    );
    assert_eq!(catalog.stop_reason, StopReason::NoNewRecords { page: 3 });
    assert_eq!(catalog.pages_fetched, 3);
}

#[tokio::test]
async fn budget_stops_before_the_repeated_page() {
    let catalog = assembler().assemble(4).await.expect("assemble");

    assert_eq!(catalog.records.len(), 4);
    assert_eq!(
        catalog.records[3].url,
        "https://raidlight.com/products/trail-bottle-600ml"
    );
    assert_eq!(catalog.stop_reason, StopReason::BudgetFilled);
    assert_eq!(catalog.pages_fetched, 2);
}

// The grid still renders but its product links were renamed, so no listing
// link matches. The run ends exactly as a genuinely exhausted catalog would.
#[tokio::test]
async fn renamed_link_classes_look_like_an_exhausted_catalog() {
    let restyled = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/raidlight-restyled");
    let extractor = FixturePageExtractor::new(restyled, StorefrontProfile::default())
        .expect("default profile is valid");
    let catalog = CatalogAssembler::new(extractor)
        .assemble(100)
        .await
        .expect("layout drift is not an error");

    assert!(catalog.records.is_empty());
    assert_eq!(catalog.stop_reason, StopReason::EmptyPage { page: 1 });
    assert_eq!(catalog.pages_fetched, 1);
}
