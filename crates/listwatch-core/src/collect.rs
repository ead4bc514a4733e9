//! Paginated walk over the upstream list endpoint for one region.
//!
//! `Start → FetchPage(1) → FetchPage(n + 1) … → Done`. The walk ends on an
//! empty page, an explicit "no more data" flag, the max-pages ceiling,
//! too many consecutive page failures, or cancellation. A page whose items
//! all fail to map counts as a failure for the consecutive limit. Listings
//! accumulate in a map keyed by external id, last write wins.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{ExternalId, ListingSnapshot};
use crate::traits::{ListingPage, ListingSource};

/// Why a region walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EmptyPage,
    NoMoreData,
    MaxPages,
    TooManyFailures,
    Cancelled,
}

/// Keyed accumulator for listings seen during one run.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    listings: HashMap<ExternalId, ListingSnapshot>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds listings, replacing earlier entries with the same id. Returns
    /// how many ids were seen for the first time.
    pub fn absorb(&mut self, listings: Vec<ListingSnapshot>) -> usize {
        let mut added = 0;
        for listing in listings {
            if self
                .listings
                .insert(listing.external_id.clone(), listing)
                .is_none()
            {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn build(self) -> HashMap<ExternalId, ListingSnapshot> {
        self.listings
    }
}

/// Deduplicated result of one region walk.
#[derive(Debug)]
pub struct CollectedSnapshot {
    pub region_code: String,
    pub listings: HashMap<ExternalId, ListingSnapshot>,
    /// False when a page failed, an item was dropped for lack of an id, the
    /// ceiling cut the walk short, or the walk was cancelled. Incomplete
    /// snapshots never close listings.
    pub complete: bool,
    pub pages_fetched: usize,
    pub page_failures: usize,
    pub shape_failures: usize,
    pub dropped_items: usize,
    pub stop: StopReason,
}

/// Walk limits for one region.
#[derive(Debug, Clone, Copy)]
pub struct CollectLimits {
    pub max_pages: Option<u32>,
    pub max_consecutive_failures: u32,
}

fn page_is_empty(page: &ListingPage) -> bool {
    page.listings.is_empty() && page.shape_failures == 0
}

/// Walks every page of a region.
///
/// # Errors
///
/// - `AppError::CredentialUnavailable` as soon as any page reports it.
/// - The last page error when the walk aborted before a single page succeeded.
pub async fn collect_region<S>(
    source: &S,
    region: &str,
    limits: CollectLimits,
    cancel: &CancellationToken,
) -> Result<CollectedSnapshot, AppError>
where
    S: ListingSource + ?Sized,
{
    let mut builder = SnapshotBuilder::new();
    let mut page_no: u32 = 1;
    let mut pages_fetched = 0usize;
    let mut page_failures = 0usize;
    let mut shape_failures = 0usize;
    let mut dropped_items = 0usize;
    let mut consecutive_failures = 0u32;
    let max_failures = limits.max_consecutive_failures.max(1);
    let mut complete = true;
    let mut last_error: Option<AppError> = None;

    let stop = loop {
        if cancel.is_cancelled() {
            complete = false;
            break StopReason::Cancelled;
        }

        match source.fetch_page(region, page_no).await {
            Ok(page) => {
                pages_fetched += 1;
                shape_failures += page.shape_failures;

                if page_is_empty(&page) {
                    break StopReason::EmptyPage;
                }

                // A dropped item may be an active listing; its absence proves nothing.
                if page.dropped > 0 {
                    dropped_items += page.dropped;
                    complete = false;
                }

                if page.listings.is_empty() {
                    consecutive_failures += 1;
                    tracing::warn!(
                        region,
                        page = page_no,
                        shape_failures = page.shape_failures,
                        consecutive_failures,
                        "List page had no usable items"
                    );
                    if consecutive_failures >= max_failures {
                        break StopReason::TooManyFailures;
                    }
                } else {
                    consecutive_failures = 0;
                }

                let has_more = page.has_more;
                let added = builder.absorb(page.listings);
                tracing::debug!(
                    region,
                    page = page_no,
                    added,
                    total = builder.len(),
                    "Fetched list page"
                );

                if has_more == Some(false) {
                    break StopReason::NoMoreData;
                }
                if limits.max_pages.is_some_and(|max| page_no >= max) {
                    tracing::warn!(
                        region,
                        max_pages = page_no,
                        "Max pages reached with more data upstream; snapshot is partial"
                    );
                    complete = false;
                    break StopReason::MaxPages;
                }
            }
            Err(AppError::CredentialUnavailable(msg)) => {
                return Err(AppError::CredentialUnavailable(msg));
            }
            Err(e) => {
                consecutive_failures += 1;
                page_failures += 1;
                complete = false;
                tracing::warn!(
                    region,
                    page = page_no,
                    consecutive_failures,
                    error = %e,
                    "List page failed, skipping"
                );
                last_error = Some(e);
                if consecutive_failures >= max_failures {
                    break StopReason::TooManyFailures;
                }
            }
        }

        page_no += 1;
    };

    if stop == StopReason::TooManyFailures && pages_fetched == 0 {
        if let Some(e) = last_error {
            return Err(e);
        }
    }

    tracing::info!(
        region,
        pages = pages_fetched,
        page_failures,
        shape_failures,
        dropped_items,
        listings = builder.len(),
        complete,
        stop = ?stop,
        "Region walk finished"
    );

    Ok(CollectedSnapshot {
        region_code: region.to_string(),
        listings: builder.build(),
        complete,
        pages_fetched,
        page_failures,
        shape_failures,
        dropped_items,
        stop,
    })
}
