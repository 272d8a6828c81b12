//! Catalog assembly: the pagination loop, cross-page dedup and stop heuristics.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shelf_adapters::{PageExtractor, PageLoadError};
use shelf_core::{ProductRecord, RawRecord};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-sync";

/// Why a successful run stopped fetching pages.
///
/// `EmptyPage` and `NoNewRecords` are heuristics: they cannot tell the real
/// end of the catalog apart from selectors that stopped matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    BudgetFilled,
    EmptyPage { page: u32 },
    NoNewRecords { page: u32 },
}

/// Result of folding one page into the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Continue { added: usize },
    Stop(StopReason),
}

/// Catalog under construction: ordered records, the dedup set and the budget.
#[derive(Debug)]
pub struct CatalogBuilder {
    max_records: usize,
    records: Vec<ProductRecord>,
    seen: HashSet<String>,
}

impl CatalogBuilder {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records,
            records: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_records
    }

    pub fn records(&self) -> &[ProductRecord] {
        &self.records
    }

    /// Append the page's unseen records in source order until the budget is hit.
    pub fn absorb_page(&mut self, page: u32, page_records: Vec<RawRecord>) -> PageOutcome {
        if page_records.is_empty() {
            return PageOutcome::Stop(StopReason::EmptyPage { page });
        }

        let mut added = 0;
        for raw in page_records {
            if self.is_full() {
                break;
            }
            let Some(product) = raw.into_product() else {
                continue;
            };
            if !self.seen.insert(product.url.clone()) {
                continue;
            }
            self.records.push(product);
            added += 1;
        }

        if added == 0 && !self.records.is_empty() {
            return PageOutcome::Stop(StopReason::NoNewRecords { page });
        }
        if self.is_full() {
            return PageOutcome::Stop(StopReason::BudgetFilled);
        }
        PageOutcome::Continue { added }
    }

    pub fn into_records(self) -> Vec<ProductRecord> {
        self.records
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledCatalog {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub stop_reason: StopReason,
    pub records: Vec<ProductRecord>,
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("error scraping page {}: {}", .0.page, .0.cause)]
    PageLoad(#[from] PageLoadError),
}

impl AssemblyError {
    pub fn page(&self) -> u32 {
        match self {
            Self::PageLoad(err) => err.page,
        }
    }
}

/// Drives an extractor page by page, strictly sequentially, from page 1.
pub struct CatalogAssembler<E> {
    extractor: E,
}

impl<E: PageExtractor> CatalogAssembler<E> {
    pub fn new(extractor: E) -> Self {
        Self { extractor }
    }

    /// Collect at most `max_records` unique products.
    ///
    /// Any page failure aborts the run and discards everything gathered so far.
    pub async fn assemble(&self, max_records: usize) -> Result<AssembledCatalog, AssemblyError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut builder = CatalogBuilder::new(max_records);
        let mut pages_fetched: u32 = 0;

        let span = info_span!("assemble", %run_id, max_records);
        let stop_reason = match self
            .run_pages(&mut builder, &mut pages_fetched)
            .instrument(span)
            .await
        {
            Ok(reason) => reason,
            Err(err) => {
                info!(
                    %run_id,
                    page = err.page,
                    "run failed; discarding {} collected records",
                    builder.len()
                );
                return Err(err.into());
            }
        };

        match stop_reason {
            StopReason::BudgetFilled => info!(%run_id, max_records, "record budget filled"),
            StopReason::EmptyPage { page } => info!(
                %run_id,
                page,
                "no products extracted from page {page}; end of catalog or layout change"
            ),
            StopReason::NoNewRecords { page } => {
                info!(%run_id, page, "no new products found on page {page}, stopping")
            }
        }

        let records = builder.into_records();
        info!(%run_id, records = records.len(), pages_fetched, "catalog assembled");
        Ok(AssembledCatalog {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_fetched,
            stop_reason,
            records,
        })
    }

    async fn run_pages(
        &self,
        builder: &mut CatalogBuilder,
        pages_fetched: &mut u32,
    ) -> Result<StopReason, PageLoadError> {
        let mut page: u32 = 1;
        while !builder.is_full() {
            let records = self.extractor.extract(page).await?;
            *pages_fetched += 1;

            match builder.absorb_page(page, records) {
                PageOutcome::Continue { added } => {
                    debug!(page, added, total = builder.len(), "page absorbed");
                    page += 1;
                }
                PageOutcome::Stop(reason) => return Ok(reason),
            }
        }
        Ok(StopReason::BudgetFilled)
    }
}
