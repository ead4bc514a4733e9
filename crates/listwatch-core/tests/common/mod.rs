//! In-memory source and store shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};

use listwatch_core::{
    ActiveListing, ActiveSet, AppError, ClosureHistoryEntry, CollectConfig, ExternalId,
    InsertOutcome, ListingPage, ListingSnapshot, ListingSource, ListingStore, ListingWrite,
    PriceHistoryEntry, RegionEntry,
};

pub fn listing(region: &str, id: &str, price: i64) -> ListingSnapshot {
    ListingSnapshot {
        external_id: id.to_string(),
        region_code: region.to_string(),
        trade_type: Some("SALE".to_string()),
        price: Some(price),
        rent: None,
        area: Some(59.9),
        detail: None,
    }
}

pub fn region(code: &str) -> RegionEntry {
    RegionEntry {
        code: code.to_string(),
        name: None,
        enabled: true,
        max_pages: None,
    }
}

pub fn collect_config(floor: usize) -> CollectConfig {
    CollectConfig {
        closure_floor: floor,
        ..CollectConfig::default()
    }
}

pub fn at(date: &str) -> DateTime<Utc> {
    let day: NaiveDate = date.parse().expect("valid date");
    day.and_hms_opt(6, 0, 0).expect("valid time").and_utc()
}

pub fn day(date: &str) -> NaiveDate {
    date.parse().expect("valid date")
}

/// Serves scripted pages per region. Page `n` is `pages[n - 1]`; past the
/// end it returns an empty page.
#[derive(Default)]
pub struct MemorySource {
    pages: Mutex<HashMap<String, Vec<Result<Vec<ListingSnapshot>, ()>>>>,
    failing_details: Mutex<HashSet<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pages(&self, region: &str, pages: Vec<Vec<ListingSnapshot>>) {
        self.pages
            .lock()
            .unwrap()
            .insert(region.to_string(), pages.into_iter().map(Ok).collect());
    }

    /// Same as `set_pages`, but `None` entries fail with a retry-exhausted error.
    pub fn set_pages_with_failures(&self, region: &str, pages: Vec<Option<Vec<ListingSnapshot>>>) {
        self.pages.lock().unwrap().insert(
            region.to_string(),
            pages.into_iter().map(|p| p.ok_or(())).collect(),
        );
    }

    pub fn fail_details(&self, ids: &[&str]) {
        let mut failing = self.failing_details.lock().unwrap();
        failing.clear();
        failing.extend(ids.iter().map(|id| id.to_string()));
    }
}

#[async_trait]
impl ListingSource for MemorySource {
    async fn fetch_page(&self, region: &str, page: u32) -> Result<ListingPage, AppError> {
        let pages = self.pages.lock().unwrap();
        let scripted = pages.get(region).and_then(|p| p.get(page as usize - 1));
        match scripted {
            None => Ok(ListingPage::default()),
            Some(Ok(listings)) => Ok(ListingPage {
                listings: listings.clone(),
                shape_failures: 0,
                dropped: 0,
                has_more: None,
            }),
            Some(Err(())) => Err(AppError::Exhausted {
                url: format!("list/{}/{}", region, page),
                attempts: 4,
                last_error: "HTTP 503".to_string(),
            }),
        }
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<Value, AppError> {
        if self.failing_details.lock().unwrap().contains(external_id) {
            return Err(AppError::Exhausted {
                url: format!("detail/{}", external_id),
                attempts: 4,
                last_error: "HTTP 500".to_string(),
            });
        }
        Ok(json!({"id": external_id, "description": "two rooms"}))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRow {
    pub listing: ListingSnapshot,
    pub is_active: bool,
    pub first_seen_date: NaiveDate,
    pub last_seen_date: NaiveDate,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

#[derive(Default)]
struct State {
    rows: BTreeMap<ExternalId, MemoryRow>,
    price_history: Vec<PriceHistoryEntry>,
    closure_history: Vec<ClosureHistoryEntry>,
}

/// Store mirroring the row-level semantics of the Postgres repository.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing_steps: Mutex<HashSet<&'static str>>,
    /// Ids the existence check misses, as if another writer inserted them
    /// between the check and the insert.
    racing_ids: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_step(&self, step: &'static str) {
        self.failing_steps.lock().unwrap().insert(step);
    }

    pub fn clear_failures(&self) {
        self.failing_steps.lock().unwrap().clear();
    }

    pub fn seed(&self, row: MemoryRow) {
        self.state
            .lock()
            .unwrap()
            .rows
            .insert(row.listing.external_id.clone(), row);
    }

    pub fn row(&self, id: &str) -> Option<MemoryRow> {
        self.state.lock().unwrap().rows.get(id).cloned()
    }

    pub fn rows(&self) -> Vec<MemoryRow> {
        self.state.lock().unwrap().rows.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .rows
            .values()
            .filter(|r| r.is_active)
            .count()
    }

    pub fn price_history(&self) -> Vec<PriceHistoryEntry> {
        self.state.lock().unwrap().price_history.clone()
    }

    pub fn closure_history(&self) -> Vec<ClosureHistoryEntry> {
        self.state.lock().unwrap().closure_history.clone()
    }

    fn check(&self, step: &'static str) -> Result<(), AppError> {
        if self.failing_steps.lock().unwrap().contains(step) {
            Err(AppError::DatabaseError(sqlx::Error::Protocol(format!(
                "{} unavailable",
                step
            ))))
        } else {
            Ok(())
        }
    }
}

fn merge<T: Clone>(stored: &Option<T>, fresh: &Option<T>) -> Option<T> {
    fresh.clone().or_else(|| stored.clone())
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn find_active_ids(&self, region: &str) -> Result<ActiveSet, AppError> {
        self.check("find_active_ids")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .rows
            .values()
            .filter(|r| r.is_active && r.listing.region_code == region)
            .map(|r| {
                (
                    r.listing.external_id.clone(),
                    ActiveListing {
                        external_id: r.listing.external_id.clone(),
                        trade_type: r.listing.trade_type.clone(),
                        price: r.listing.price,
                        rent: r.listing.rent,
                        first_seen_date: r.first_seen_date,
                        last_seen_date: r.last_seen_date,
                    },
                )
            })
            .collect())
    }

    async fn find_existing_ids(&self, ids: &[ExternalId]) -> Result<HashSet<ExternalId>, AppError> {
        self.check("existence_check")?;
        let racing = self.racing_ids.lock().unwrap();
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter(|id| state.rows.contains_key(*id) && !racing.contains(*id))
            .cloned()
            .collect())
    }

    async fn insert_listings(&self, batch: &[ListingWrite]) -> Result<InsertOutcome, AppError> {
        self.check("insert_listings")?;
        let mut state = self.state.lock().unwrap();
        let mut outcome = InsertOutcome::default();
        for write in batch {
            let id = &write.listing.external_id;
            if state.rows.contains_key(id) {
                outcome.duplicates.push(id.clone());
                continue;
            }
            state.rows.insert(
                id.clone(),
                MemoryRow {
                    listing: write.listing.clone(),
                    is_active: true,
                    first_seen_date: write.seen_date,
                    last_seen_date: write.seen_date,
                    closed_at: None,
                    close_reason: None,
                },
            );
            outcome.inserted += 1;
        }
        Ok(outcome)
    }

    async fn update_listings(&self, batch: &[ListingWrite]) -> Result<u64, AppError> {
        self.check("update_listings")?;
        let mut state = self.state.lock().unwrap();
        let mut touched = 0;
        for write in batch {
            let Some(row) = state.rows.get_mut(&write.listing.external_id) else {
                continue;
            };
            let fresh = &write.listing;
            row.listing = ListingSnapshot {
                external_id: fresh.external_id.clone(),
                region_code: fresh.region_code.clone(),
                trade_type: merge(&row.listing.trade_type, &fresh.trade_type),
                price: merge(&row.listing.price, &fresh.price),
                rent: merge(&row.listing.rent, &fresh.rent),
                area: merge(&row.listing.area, &fresh.area),
                detail: merge(&row.listing.detail, &fresh.detail),
            };
            row.is_active = true;
            row.closed_at = None;
            row.close_reason = None;
            row.last_seen_date = row.last_seen_date.max(write.seen_date);
            touched += 1;
        }
        Ok(touched)
    }

    async fn append_price_history(&self, batch: &[PriceHistoryEntry]) -> Result<u64, AppError> {
        self.check("append_price_history")?;
        let mut state = self.state.lock().unwrap();
        state.price_history.extend(batch.iter().cloned());
        Ok(batch.len() as u64)
    }

    async fn append_closure_history(&self, batch: &[ClosureHistoryEntry]) -> Result<u64, AppError> {
        self.check("append_closure_history")?;
        let mut state = self.state.lock().unwrap();
        state.closure_history.extend(batch.iter().cloned());
        Ok(batch.len() as u64)
    }

    async fn close_listings(
        &self,
        ids: &[ExternalId],
        closed_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<ExternalId>, AppError> {
        self.check("close_listings")?;
        let mut state = self.state.lock().unwrap();
        let mut transitioned = Vec::new();
        for id in ids {
            if let Some(row) = state.rows.get_mut(id) {
                if row.is_active {
                    row.is_active = false;
                    row.closed_at = Some(closed_at);
                    row.close_reason = Some(reason.to_string());
                    transitioned.push(id.clone());
                }
            }
        }
        Ok(transitioned)
    }
}

impl MemoryStore {
    pub fn race_existence_check(&self, ids: &[&str]) {
        self.racing_ids
            .lock()
            .unwrap()
            .extend(ids.iter().map(|id| id.to_string()));
    }
}
