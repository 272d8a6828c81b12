//! Page extractor contract + storefront listing adapters.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use shelf_browser::{BrowserError, BrowserSession, SnapshotStore};
use shelf_core::RawRecord;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "shelf-adapters";

pub const PAGE_PLACEHOLDER: &str = "{page}";

/// Why a single page could not be turned into records.
#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("page never became ready: {0}")]
    NotReady(String),
    #[error("product grid `{selector}` not visible after {waited:?}")]
    GridNotVisible { selector: String, waited: Duration },
    #[error("extraction failed: {0}")]
    Script(String),
    #[error("page load cancelled")]
    Cancelled,
    #[error("browser session failure: {0}")]
    Browser(#[source] BrowserError),
}

impl From<BrowserError> for LoadFailure {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::NotVisible { selector, waited } => Self::GridNotVisible { selector, waited },
            err @ BrowserError::Navigation { .. } => Self::Navigation(err.to_string()),
            err @ BrowserError::NotReady { .. } => Self::NotReady(err.to_string()),
            err @ (BrowserError::Script(_) | BrowserError::Decode(_)) => Self::Script(err.to_string()),
            other => Self::Browser(other),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to load page {page}")]
pub struct PageLoadError {
    pub page: u32,
    #[source]
    pub cause: LoadFailure,
}

impl PageLoadError {
    pub fn new(page: u32, cause: LoadFailure) -> Self {
        Self { page, cause }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, LoadFailure::Cancelled)
    }
}

/// The only seam the catalog loop needs from the page-rendering layer.
///
/// `page` is 1-based. An empty result is a valid answer, not an error.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract(&self, page: u32) -> Result<Vec<RawRecord>, PageLoadError>;
}

#[async_trait]
impl<T: PageExtractor + ?Sized> PageExtractor for &T {
    async fn extract(&self, page: u32) -> Result<Vec<RawRecord>, PageLoadError> {
        (**self).extract(page).await
    }
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("url template `{0}` has no `{{page}}` placeholder")]
    MissingPlaceholder(String),
    #[error("url template `{template}` does not produce a valid URL: {message}")]
    InvalidTemplate { template: String, message: String },
    #[error("page index must be >= 1, got {0}")]
    InvalidPage(u32),
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
}

/// Fixed page template plus the selectors used to read one listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorefrontProfile {
    pub url_template: String,
    pub ready_selector: String,
    pub container_selector: String,
    pub link_selector: String,
    pub title_selector: String,
    pub image_selector: String,
    pub price_selector: String,
    pub rating_selector: String,
    pub rating_avg_attr: String,
    pub rating_count_attr: String,
    pub product_path: String,
}

impl Default for StorefrontProfile {
    fn default() -> Self {
        Self {
            url_template: "https://raidlight.com/collections/all?page={page}".to_string(),
            ready_selector: "body".to_string(),
            container_selector: ".grid-product".to_string(),
            link_selector: "a.grid-product__link".to_string(),
            title_selector: ".grid-product__title".to_string(),
            image_selector: ".grid__image-ratio, img".to_string(),
            price_selector: ".grid-product__price .money".to_string(),
            rating_selector: ".jdgm-prev-badge".to_string(),
            rating_avg_attr: "data-average-rating".to_string(),
            rating_count_attr: "data-number-of-reviews".to_string(),
            product_path: "/products/".to_string(),
        }
    }
}

impl StorefrontProfile {
    pub fn with_url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = template.into();
        self
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if !self.url_template.contains(PAGE_PLACEHOLDER) {
            return Err(ProfileError::MissingPlaceholder(self.url_template.clone()));
        }
        let first = self.url_template.replace(PAGE_PLACEHOLDER, "1");
        Url::parse(&first).map_err(|e| ProfileError::InvalidTemplate {
            template: self.url_template.clone(),
            message: e.to_string(),
        })?;
        ListingSelectors::compile(self)?;
        compile_selector(&self.ready_selector)?;
        Ok(())
    }

    pub fn page_url(&self, page: u32) -> Result<String, ProfileError> {
        if page == 0 {
            return Err(ProfileError::InvalidPage(page));
        }
        if !self.url_template.contains(PAGE_PLACEHOLDER) {
            return Err(ProfileError::MissingPlaceholder(self.url_template.clone()));
        }
        Ok(self.url_template.replace(PAGE_PLACEHOLDER, &page.to_string()))
    }
}

/// Load a profile from JSON; omitted keys keep their defaults.
pub fn load_profile(path: impl AsRef<Path>) -> Result<StorefrontProfile> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let profile: StorefrontProfile =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    profile
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(profile)
}

fn compile_selector(selector: &str) -> Result<Selector, ProfileError> {
    Selector::parse(selector).map_err(|e| ProfileError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

struct ListingSelectors {
    container: Selector,
    link: Selector,
    title: Selector,
    image: Selector,
    price: Selector,
    rating: Selector,
}

impl ListingSelectors {
    fn compile(profile: &StorefrontProfile) -> Result<Self, ProfileError> {
        Ok(Self {
            container: compile_selector(&profile.container_selector)?,
            link: compile_selector(&profile.link_selector)?,
            title: compile_selector(&profile.title_selector)?,
            image: compile_selector(&profile.image_selector)?,
            price: compile_selector(&profile.price_selector)?,
            rating: compile_selector(&profile.rating_selector)?,
        })
    }
}

fn trimmed_text(node: ElementRef<'_>) -> String {
    node.text().collect::<String>().trim().to_string()
}

fn resolve_url(base: Option<&Url>, raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    match base {
        Some(base) => base
            .join(raw)
            .map(String::from)
            .unwrap_or_else(|_| raw.to_string()),
        None => raw.to_string(),
    }
}

/// Leading decimal number of `raw`, `0.0` when there is none.
fn parse_leading_f64(raw: &str) -> f64 {
    let trimmed = raw.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, ch) in trimmed.char_indices() {
        if ch.is_ascii_digit() {
            end = i + 1;
        } else if ch == '.' && !seen_dot {
            seen_dot = true;
        } else {
            break;
        }
    }
    trimmed[..end].parse().unwrap_or(0.0)
}

/// Leading integer of `raw` ("27 reviews" -> 27), `0` when there is none.
fn parse_leading_u32(raw: &str) -> u32 {
    let trimmed = raw.trim_start();
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().unwrap_or(0)
}

fn extract_record(
    product: ElementRef<'_>,
    selectors: &ListingSelectors,
    profile: &StorefrontProfile,
    base: Option<&Url>,
) -> RawRecord {
    let url = product
        .select(&selectors.link)
        .next()
        .and_then(|link| link.value().attr("href"))
        .map(|href| resolve_url(base, href))
        .unwrap_or_default();
    let name = product
        .select(&selectors.title)
        .next()
        .map(trimmed_text)
        .unwrap_or_default();
    let image = product
        .select(&selectors.image)
        .next()
        .filter(|el| el.value().name().eq_ignore_ascii_case("img"))
        .and_then(|img| img.value().attr("src"))
        .map(|src| resolve_url(base, src))
        .unwrap_or_default();
    let price = product
        .select(&selectors.price)
        .next()
        .map(trimmed_text)
        .unwrap_or_default();

    let (rating_avg, rating_count) = match product.select(&selectors.rating).next() {
        Some(badge) => (
            badge
                .value()
                .attr(&profile.rating_avg_attr)
                .map(parse_leading_f64)
                .unwrap_or(0.0),
            badge
                .value()
                .attr(&profile.rating_count_attr)
                .map(parse_leading_u32)
                .unwrap_or(0),
        ),
        None => (0.0, 0),
    };

    RawRecord {
        url,
        name,
        image,
        price,
        rating_avg,
        rating_count,
    }
}

/// Read every product container of a rendered listing, in document order.
///
/// Links and image sources are resolved against `page_url`. Containers without
/// a link, or whose link is not a product page, are dropped.
pub fn parse_listing_html(
    profile: &StorefrontProfile,
    html: &str,
    page_url: &str,
) -> Result<Vec<RawRecord>, ProfileError> {
    let selectors = ListingSelectors::compile(profile)?;
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    Ok(document
        .select(&selectors.container)
        .map(|product| extract_record(product, &selectors, profile, base.as_ref()))
        .filter(|record| !record.url.is_empty() && record.url.contains(&profile.product_path))
        .collect())
}

/// Renders each page in the caller's browser session.
pub struct BrowserPageExtractor<'a> {
    session: &'a BrowserSession,
    profile: StorefrontProfile,
    snapshots: Option<SnapshotStore>,
    cancel: CancellationToken,
}

impl<'a> BrowserPageExtractor<'a> {
    pub fn new(session: &'a BrowserSession, profile: StorefrontProfile) -> Result<Self, ProfileError> {
        profile.validate()?;
        Ok(Self {
            session,
            profile,
            snapshots: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Await `load`, giving up with `LoadFailure::Cancelled` as soon as `cancel` fires.
async fn load_or_cancel<T, F>(page: u32, cancel: &CancellationToken, load: F) -> Result<T, PageLoadError>
where
    F: Future<Output = Result<T, BrowserError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PageLoadError::new(page, LoadFailure::Cancelled)),
        result = load => result.map_err(|e| PageLoadError::new(page, e.into())),
    }
}

#[async_trait]
impl<'a> PageExtractor for BrowserPageExtractor<'a> {
    async fn extract(&self, page: u32) -> Result<Vec<RawRecord>, PageLoadError> {
        let url = self
            .profile
            .page_url(page)
            .map_err(|e| PageLoadError::new(page, LoadFailure::Navigation(e.to_string())))?;

        let rendered = load_or_cancel(
            page,
            &self.cancel,
            self.session.render_listing(
                &url,
                &self.profile.ready_selector,
                &self.profile.container_selector,
            ),
        )
        .await?;

        let records = parse_listing_html(&self.profile, &rendered.html, &rendered.final_url)
            .map_err(|e| PageLoadError::new(page, LoadFailure::Script(e.to_string())))?;

        if let Some(store) = &self.snapshots {
            match store.record_page(page, &rendered, records.len()).await {
                Ok(snapshot) => debug!(page, file = %snapshot.html_file, "stored page snapshot"),
                Err(err) => warn!(page, "storing page snapshot failed: {err:#}"),
            }
        }

        info!(page, %url, records = records.len(), "page extracted");
        Ok(records)
    }
}

/// Reads saved listing pages (`page-<n>.html`) from a directory.
///
/// A missing page file renders as an empty listing.
#[derive(Debug, Clone)]
pub struct FixturePageExtractor {
    root: PathBuf,
    profile: StorefrontProfile,
}

impl FixturePageExtractor {
    pub fn new(root: impl Into<PathBuf>, profile: StorefrontProfile) -> Result<Self, ProfileError> {
        profile.validate()?;
        Ok(Self {
            root: root.into(),
            profile,
        })
    }

    pub fn page_path(&self, page: u32) -> PathBuf {
        self.root.join(format!("page-{page}.html"))
    }
}

#[async_trait]
impl PageExtractor for FixturePageExtractor {
    async fn extract(&self, page: u32) -> Result<Vec<RawRecord>, PageLoadError> {
        let url = self
            .profile
            .page_url(page)
            .map_err(|e| PageLoadError::new(page, LoadFailure::Navigation(e.to_string())))?;
        let path = self.page_path(page);
        let html = match tokio::fs::read_to_string(&path).await {
            Ok(html) => html,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(page, path = %path.display(), "no saved page; treating as empty listing");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(PageLoadError::new(
                    page,
                    LoadFailure::Navigation(format!("reading {}: {err}", path.display())),
                ));
            }
        };
        parse_listing_html(&self.profile, &html, &url)
            .map_err(|e| PageLoadError::new(page, LoadFailure::Script(e.to_string())))
    }
}
