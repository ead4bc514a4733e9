//! Domain models shared by the collector, the reconciliation engine and the
//! repository layer.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable upstream-issued identifier for a listing.
pub type ExternalId = String;

/// Close reason written when an active listing is missing from a trusted snapshot.
pub const CLOSE_REASON_DISAPPEARED: &str = "disappeared";

/// One listing as observed during a single run.
///
/// Snapshots are never mutated after construction; enrichment produces a new
/// value through [`ListingSnapshot::with_detail`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub external_id: ExternalId,
    pub region_code: String,
    pub trade_type: Option<String>,
    pub price: Option<i64>,
    pub rent: Option<i64>,
    pub area: Option<f64>,
    pub detail: Option<ListingDetail>,
}

impl ListingSnapshot {
    /// Returns a copy of this snapshot carrying the given detail.
    pub fn with_detail(&self, detail: ListingDetail) -> Self {
        Self {
            detail: Some(detail),
            ..self.clone()
        }
    }
}

/// Detail payload fetched for one listing, kept opaque apart from the
/// resolved address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDetail {
    pub payload: Value,
    pub address: Option<AddressResult>,
}

/// Result of converting a coordinate into an address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressResult {
    pub address: String,
    pub postal_code: Option<String>,
}

/// A persisted listing row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredListing {
    pub external_id: String,
    pub region_code: String,
    pub trade_type: Option<String>,
    pub price: Option<i64>,
    pub rent: Option<i64>,
    pub area: Option<f64>,
    pub detail: Option<sqlx::types::Json<Value>>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub is_active: bool,
    pub first_seen_date: NaiveDate,
    pub last_seen_date: NaiveDate,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

/// The stored fields of an active listing that reconciliation compares against.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ActiveListing {
    pub external_id: String,
    pub trade_type: Option<String>,
    pub price: Option<i64>,
    pub rent: Option<i64>,
    pub first_seen_date: NaiveDate,
    pub last_seen_date: NaiveDate,
}

/// Active listings of one region keyed by external id.
pub type ActiveSet = HashMap<ExternalId, ActiveListing>;

/// A listing to insert or update, stamped with the date it was seen.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingWrite {
    pub listing: ListingSnapshot,
    pub seen_date: NaiveDate,
}

/// Append-only record of a price, rent or trade type change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceHistoryEntry {
    pub external_id: ExternalId,
    pub previous_price: Option<i64>,
    pub new_price: Option<i64>,
    pub previous_rent: Option<i64>,
    pub new_rent: Option<i64>,
    pub previous_trade_type: Option<String>,
    pub new_trade_type: Option<String>,
    pub change_amount: Option<i64>,
    pub change_percent: Option<f64>,
    pub changed_date: NaiveDate,
}

/// Append-only record of one active to closed transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosureHistoryEntry {
    pub external_id: ExternalId,
    pub days_active: i64,
    pub final_price: Option<i64>,
    pub close_reason: String,
    pub closed_date: NaiveDate,
}
