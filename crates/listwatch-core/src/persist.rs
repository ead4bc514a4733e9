//! Applies a [`ReconcilePlan`] to a [`ListingStore`] in grouped operations.
//!
//! Round trips per run: one existence check, one insert, one update, one
//! price-history append, one close, one closure-history append. A failed
//! step is logged and counted; the following steps still run, except the
//! history append describing a state change that did not happen.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::models::{ExternalId, ListingSnapshot, ListingWrite, CLOSE_REASON_DISAPPEARED};
use crate::reconcile::ReconcilePlan;
use crate::run::RunStats;
use crate::traits::ListingStore;

/// Counters produced by one [`apply`] call.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PersistStats {
    pub inserted: usize,
    pub updated: usize,
    /// NEW listings that already existed as closed rows and were reopened.
    pub reopened: usize,
    /// Inserts that hit an existing key and were applied as updates.
    pub duplicates: usize,
    pub price_history_rows: usize,
    pub closed: usize,
    pub closure_history_rows: usize,
    pub failed_steps: Vec<&'static str>,
}

impl PersistStats {
    pub fn merge_into(&self, stats: &mut RunStats) {
        stats.reopened += self.reopened;
        stats.closed += self.closed;
        stats.price_history_rows += self.price_history_rows;
        stats.closure_history_rows += self.closure_history_rows;
        stats.persist_failures += self.failed_steps.len();
    }

    fn fail(&mut self, step: &'static str, error: AppError) {
        let error = AppError::PersistencePartialFailure {
            step,
            message: error.to_string(),
        };
        tracing::warn!(step, error = %error, "Persistence step failed, continuing");
        self.failed_steps.push(step);
    }
}

fn writes_for<'a, I>(listings: I, plan: &ReconcilePlan) -> Vec<ListingWrite>
where
    I: IntoIterator<Item = &'a ListingSnapshot>,
{
    listings
        .into_iter()
        .map(|listing| ListingWrite {
            listing: listing.clone(),
            seen_date: plan.date,
        })
        .collect()
}

/// Persists the NEW, CHANGED/SEEN and CLOSED batches of a plan.
pub async fn apply<S>(store: &S, plan: &ReconcilePlan, closed_at: DateTime<Utc>) -> PersistStats
where
    S: ListingStore + ?Sized,
{
    let mut stats = PersistStats::default();

    // Closed rows reappearing in the snapshot are not active, so they arrive
    // here as NEW; they must be reopened rather than inserted.
    let new_ids: Vec<ExternalId> = plan
        .new_listings
        .iter()
        .map(|l| l.external_id.clone())
        .collect();
    let existing: HashSet<ExternalId> = if new_ids.is_empty() {
        HashSet::new()
    } else {
        match store.find_existing_ids(&new_ids).await {
            Ok(found) => found,
            Err(e) => {
                stats.fail("existence_check", e);
                HashSet::new()
            }
        }
    };

    let (reopen, fresh): (Vec<_>, Vec<_>) = plan
        .new_listings
        .iter()
        .partition(|l| existing.contains(&l.external_id));
    stats.reopened = reopen.len();

    let mut updates = writes_for(
        plan.changed_listings
            .iter()
            .chain(plan.seen_listings.iter())
            .chain(reopen),
        plan,
    );

    let inserts = writes_for(fresh, plan);
    if !inserts.is_empty() {
        match store.insert_listings(&inserts).await {
            Ok(outcome) => {
                stats.inserted = outcome.inserted as usize;
                if !outcome.duplicates.is_empty() {
                    tracing::info!(
                        region = plan.region_code.as_str(),
                        duplicates = outcome.duplicates.len(),
                        "Inserts already applied, falling back to update"
                    );
                    let dupes: HashSet<&ExternalId> = outcome.duplicates.iter().collect();
                    stats.duplicates = dupes.len();
                    updates.extend(
                        inserts
                            .iter()
                            .filter(|w| dupes.contains(&w.listing.external_id))
                            .cloned(),
                    );
                }
            }
            Err(e) => stats.fail("insert_listings", e),
        }
    }

    let mut updates_ok = true;
    if !updates.is_empty() {
        match store.update_listings(&updates).await {
            Ok(touched) => stats.updated = touched as usize,
            Err(e) => {
                updates_ok = false;
                stats.fail("update_listings", e);
            }
        }
    }

    if !plan.price_history.is_empty() {
        if updates_ok {
            match store.append_price_history(&plan.price_history).await {
                Ok(rows) => stats.price_history_rows = rows as usize,
                Err(e) => stats.fail("append_price_history", e),
            }
        } else {
            tracing::warn!(
                region = plan.region_code.as_str(),
                rows = plan.price_history.len(),
                "Skipping price history; listing update failed"
            );
        }
    }

    let closed_ids = plan.closed_ids();
    if !closed_ids.is_empty() {
        match store
            .close_listings(&closed_ids, closed_at, CLOSE_REASON_DISAPPEARED)
            .await
        {
            Ok(transitioned) => {
                stats.closed = transitioned.len();
                let transitioned: HashSet<ExternalId> = transitioned.into_iter().collect();
                let history: Vec<_> = plan
                    .closures
                    .iter()
                    .filter(|c| transitioned.contains(&c.external_id))
                    .cloned()
                    .collect();
                if !history.is_empty() {
                    match store.append_closure_history(&history).await {
                        Ok(rows) => stats.closure_history_rows = rows as usize,
                        Err(e) => stats.fail("append_closure_history", e),
                    }
                }
            }
            Err(e) => stats.fail("close_listings", e),
        }
    }

    tracing::info!(
        region = plan.region_code.as_str(),
        inserted = stats.inserted,
        updated = stats.updated,
        reopened = stats.reopened,
        closed = stats.closed,
        price_history = stats.price_history_rows,
        closure_history = stats.closure_history_rows,
        failed_steps = stats.failed_steps.len(),
        "Batches applied"
    );

    stats
}
