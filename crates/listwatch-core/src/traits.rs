//! Traits decoupling the pipeline from I/O.
//!
//! - [`ListingSource`] - upstream listing API (implemented by `listwatch-client`)
//! - [`ListingStore`] - persistent store (implemented by `listwatch-db`)
//! - [`RunObserver`] - run observability side-channel
//! - [`Geocoder`] - coordinate to address collaborator
//!
//! Every method is object safe so implementations can be shared as
//! `Arc<dyn Trait>` across regions.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::AppError;
use crate::models::{
    ActiveSet, AddressResult, ClosureHistoryEntry, ExternalId, ListingSnapshot, ListingWrite,
    PriceHistoryEntry,
};
use crate::run::{RunContext, RunPhase, RunStats};

/// One page of the paginated list endpoint, already mapped to snapshots.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub listings: Vec<ListingSnapshot>,
    /// Malformed fields and unmappable items on this page.
    pub shape_failures: usize,
    /// Items skipped entirely because they carry no usable id.
    pub dropped: usize,
    /// Explicit "more data" flag; `None` when the upstream only signals the
    /// end with an empty page.
    pub has_more: Option<bool>,
}

/// Upstream listing API.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Fetches one list page (1-based) for a region.
    async fn fetch_page(&self, region: &str, page: u32) -> Result<ListingPage, AppError>;

    /// Fetches the opaque detail payload of one listing.
    async fn fetch_detail(&self, external_id: &str) -> Result<Value, AppError>;
}

/// Result of a grouped insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    /// Ids that already existed; callers apply them as updates instead.
    pub duplicates: Vec<ExternalId>,
}

/// Narrow repository interface used by reconciliation and batch persistence.
///
/// Every write is a grouped, row-level operation so concurrent region runs
/// touching disjoint ids never block each other.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Active listings of a region with the fields reconciliation compares.
    async fn find_active_ids(&self, region: &str) -> Result<ActiveSet, AppError>;

    /// Subset of `ids` that exist in the store, active or not.
    async fn find_existing_ids(&self, ids: &[ExternalId]) -> Result<HashSet<ExternalId>, AppError>;

    /// Inserts new listings as active with `first_seen_date = last_seen_date = seen_date`.
    async fn insert_listings(&self, batch: &[ListingWrite]) -> Result<InsertOutcome, AppError>;

    /// Refreshes listing fields, marks them active and moves `last_seen_date`
    /// forward (never backwards). Returns the number of rows touched.
    async fn update_listings(&self, batch: &[ListingWrite]) -> Result<u64, AppError>;

    async fn append_price_history(&self, batch: &[PriceHistoryEntry]) -> Result<u64, AppError>;

    async fn append_closure_history(&self, batch: &[ClosureHistoryEntry]) -> Result<u64, AppError>;

    /// Soft-closes the given listings that are still active and returns the
    /// ids that actually transitioned.
    async fn close_listings(
        &self,
        ids: &[ExternalId],
        closed_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<ExternalId>, AppError>;
}

/// Receives run lifecycle events. Errors are logged by the caller and never
/// abort the run.
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn on_run_start(&self, run: &RunContext) -> Result<(), AppError>;

    async fn on_run_progress(
        &self,
        run: &RunContext,
        phase: RunPhase,
        stats: &RunStats,
    ) -> Result<(), AppError>;

    async fn on_run_complete(&self, run: &RunContext, stats: &RunStats) -> Result<(), AppError>;

    async fn on_run_failed(
        &self,
        run: &RunContext,
        stats: &RunStats,
        error: &AppError,
    ) -> Result<(), AppError>;
}

/// Converts coordinates found in detail payloads into addresses.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn convert_coordinate_to_address(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<AddressResult, AppError>;
}
