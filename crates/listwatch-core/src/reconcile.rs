//! Reconciliation of a fresh snapshot against the stored active set.
//!
//! This module is pure business logic: it never touches the network or the
//! database. Given the deduplicated snapshot of a region and the listings
//! currently active in the store, it classifies every id as NEW, CHANGED,
//! SEEN or CLOSED and prepares the history rows to append.
//!
//! Closures are only computed when the snapshot can be trusted: it must be
//! complete and larger than the configured sanity floor. A degraded fetch is
//! never read as "everything disappeared".

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::config::CollectConfig;
use crate::error::AppError;
use crate::models::{
    ActiveListing, ActiveSet, ClosureHistoryEntry, ExternalId, ListingSnapshot,
    PriceHistoryEntry, CLOSE_REASON_DISAPPEARED,
};
use crate::run::{ClosureSuppression, RunStats, SuppressionReason};

/// Classification of one listing during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOutcome {
    /// Not currently active in the store
    New,
    /// Active, and price, rent or trade type differ from the stored values
    Changed,
    /// Active and unchanged - last seen date bump only
    Seen,
    /// Active in the store but missing from a trusted snapshot
    Closed,
}

/// Result of comparing one snapshot item with its stored counterpart.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileDecision {
    pub outcome: ListingOutcome,
    /// History row to append, present only for `Changed`
    pub price_change: Option<PriceHistoryEntry>,
    /// Human-readable reason for the decision
    pub reason: &'static str,
}

/// A fresh value that is absent never counts as a change.
fn field_changed<T: PartialEq>(stored: &Option<T>, fresh: &Option<T>) -> bool {
    match fresh {
        Some(value) => stored.as_ref() != Some(value),
        None => false,
    }
}

/// Computes `(new - old, (new - old) / old * 100)`.
///
/// The percentage is rounded to two decimals and omitted when `old` is zero.
/// Both are omitted when either side is unknown or the difference does not
/// fit in an `i64`.
pub fn price_delta(old: Option<i64>, new: Option<i64>) -> (Option<i64>, Option<f64>) {
    match (old, new) {
        (Some(old), Some(new)) => {
            let Some(amount) = new.checked_sub(old) else {
                tracing::warn!(old, new, "Price delta out of range, left unset");
                return (None, None);
            };
            let percent = if old == 0 {
                None
            } else {
                let raw = amount as f64 / old as f64 * 100.0;
                Some((raw * 100.0).round() / 100.0)
            };
            (Some(amount), percent)
        }
        _ => (None, None),
    }
}

/// Decides how a snapshot item is reconciled.
///
/// # Arguments
/// * `existing` - The stored active listing with this id (None if not active)
/// * `fresh` - The listing as seen in this run
/// * `today` - The date stamped on any history row
pub fn classify(
    existing: Option<&ActiveListing>,
    fresh: &ListingSnapshot,
    today: NaiveDate,
) -> ReconcileDecision {
    let Some(stored) = existing else {
        return ReconcileDecision {
            outcome: ListingOutcome::New,
            price_change: None,
            reason: "not in active set",
        };
    };

    let price_changed = field_changed(&stored.price, &fresh.price);
    let rent_changed = field_changed(&stored.rent, &fresh.rent);
    let trade_type_changed = field_changed(&stored.trade_type, &fresh.trade_type);

    if !(price_changed || rent_changed || trade_type_changed) {
        return ReconcileDecision {
            outcome: ListingOutcome::Seen,
            price_change: None,
            reason: "price, rent and trade type unchanged",
        };
    }

    let new_price = fresh.price.or(stored.price);
    let new_rent = fresh.rent.or(stored.rent);
    let new_trade_type = fresh.trade_type.clone().or_else(|| stored.trade_type.clone());
    let (change_amount, change_percent) = price_delta(stored.price, new_price);

    let reason = if price_changed {
        "price changed"
    } else if rent_changed {
        "rent changed"
    } else {
        "trade type changed"
    };

    ReconcileDecision {
        outcome: ListingOutcome::Changed,
        price_change: Some(PriceHistoryEntry {
            external_id: fresh.external_id.clone(),
            previous_price: stored.price,
            new_price,
            previous_rent: stored.rent,
            new_rent,
            previous_trade_type: stored.trade_type.clone(),
            new_trade_type,
            change_amount,
            change_percent,
            changed_date: today,
        }),
        reason,
    }
}

/// Builds the closure row for an active listing missing from the snapshot.
///
/// `days_active` is the span between first and last sighting; the final
/// price is the last stored price.
pub fn closure_for(stored: &ActiveListing, closed_date: NaiveDate) -> ClosureHistoryEntry {
    ClosureHistoryEntry {
        external_id: stored.external_id.clone(),
        days_active: (stored.last_seen_date - stored.first_seen_date).num_days().max(0),
        final_price: stored.price,
        close_reason: CLOSE_REASON_DISAPPEARED.to_string(),
        closed_date,
    }
}

/// Mass-closure guard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosurePolicy {
    /// The snapshot must hold strictly more listings than this.
    pub floor: usize,
    /// Optional minimum of `snapshot_len / active_len`.
    pub min_ratio: Option<f64>,
}

impl ClosurePolicy {
    pub fn from_config(config: &CollectConfig) -> Self {
        Self {
            floor: config.closure_floor,
            min_ratio: config.closure_min_ratio,
        }
    }

    /// Smallest snapshot size that allows closures against `active_len`
    /// currently active listings.
    pub fn required_len(&self, active_len: usize) -> usize {
        let by_floor = self.floor + 1;
        let by_ratio = self
            .min_ratio
            .map(|ratio| (ratio * active_len as f64).ceil() as usize)
            .unwrap_or(0);
        by_floor.max(by_ratio)
    }

    pub fn evaluate(&self, snapshot_len: usize, active_len: usize, complete: bool) -> ClosureGuard {
        if !complete {
            return ClosureGuard::Incomplete { snapshot_len };
        }
        let required = self.required_len(active_len);
        if snapshot_len < required {
            ClosureGuard::BelowFloor {
                snapshot_len,
                required,
            }
        } else {
            ClosureGuard::Allowed
        }
    }
}

/// Whether a reconciliation run may close listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureGuard {
    Allowed,
    /// The snapshot is too small to be trusted.
    BelowFloor { snapshot_len: usize, required: usize },
    /// At least one page failed or the walk was interrupted.
    Incomplete { snapshot_len: usize },
}

impl ClosureGuard {
    pub fn allows_closures(&self) -> bool {
        matches!(self, ClosureGuard::Allowed)
    }

    /// The violation to report when closures are suppressed.
    pub fn violation(&self) -> Option<AppError> {
        match *self {
            ClosureGuard::Allowed => None,
            ClosureGuard::BelowFloor {
                snapshot_len,
                required,
            } => Some(AppError::SanityFloorViolation {
                snapshot_len,
                floor: required.saturating_sub(1),
            }),
            ClosureGuard::Incomplete { snapshot_len } => {
                Some(AppError::IncompleteSnapshot { snapshot_len })
            }
        }
    }

    /// Diagnostics stored with the run when closures are suppressed.
    pub fn suppression(&self) -> Option<ClosureSuppression> {
        let message = self.violation()?.to_string();
        match *self {
            ClosureGuard::Allowed => None,
            ClosureGuard::BelowFloor {
                snapshot_len,
                required,
            } => Some(ClosureSuppression {
                reason: SuppressionReason::BelowFloor,
                snapshot_len,
                required: Some(required),
                message,
            }),
            ClosureGuard::Incomplete { snapshot_len } => Some(ClosureSuppression {
                reason: SuppressionReason::Incomplete,
                snapshot_len,
                required: None,
                message,
            }),
        }
    }
}

/// Everything batch persistence needs to apply one region run.
///
/// All vectors are ordered by external id.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub region_code: String,
    pub date: NaiveDate,
    pub new_listings: Vec<ListingSnapshot>,
    pub changed_listings: Vec<ListingSnapshot>,
    pub seen_listings: Vec<ListingSnapshot>,
    pub price_history: Vec<PriceHistoryEntry>,
    pub closures: Vec<ClosureHistoryEntry>,
    pub guard: ClosureGuard,
}

impl ReconcilePlan {
    pub fn closed_ids(&self) -> Vec<ExternalId> {
        self.closures.iter().map(|c| c.external_id.clone()).collect()
    }

    /// Records planned outcomes. Closed counts are recorded by persistence
    /// once the transitions actually happened.
    pub fn record_into(&self, stats: &mut RunStats) {
        for _ in &self.new_listings {
            stats.record(ListingOutcome::New);
        }
        for _ in &self.changed_listings {
            stats.record(ListingOutcome::Changed);
        }
        for _ in &self.seen_listings {
            stats.record(ListingOutcome::Seen);
        }
        stats.closures_suppressed = !self.guard.allows_closures();
        stats.closure_suppression = self.guard.suppression();
    }
}

/// Diffs a deduplicated snapshot against the active set of one region.
///
/// # Errors
///
/// Returns `AppError::SanityFloorViolation` when the snapshot is empty: there
/// is nothing to reconcile and nothing that may be closed.
pub fn reconcile(
    region_code: &str,
    snapshot: &HashMap<ExternalId, ListingSnapshot>,
    active: &ActiveSet,
    policy: &ClosurePolicy,
    snapshot_complete: bool,
    today: NaiveDate,
) -> Result<ReconcilePlan, AppError> {
    if snapshot.is_empty() {
        return Err(AppError::SanityFloorViolation {
            snapshot_len: 0,
            floor: policy.floor,
        });
    }

    let guard = policy.evaluate(snapshot.len(), active.len(), snapshot_complete);

    let mut ids: Vec<&ExternalId> = snapshot.keys().collect();
    ids.sort();

    let mut plan = ReconcilePlan {
        region_code: region_code.to_string(),
        date: today,
        new_listings: Vec::new(),
        changed_listings: Vec::new(),
        seen_listings: Vec::new(),
        price_history: Vec::new(),
        closures: Vec::new(),
        guard,
    };

    for id in ids {
        let fresh = &snapshot[id];
        let decision = classify(active.get(id), fresh, today);
        match decision.outcome {
            ListingOutcome::New => plan.new_listings.push(fresh.clone()),
            ListingOutcome::Seen => plan.seen_listings.push(fresh.clone()),
            ListingOutcome::Changed => {
                plan.changed_listings.push(fresh.clone());
                if let Some(entry) = decision.price_change {
                    plan.price_history.push(entry);
                }
            }
            // Closures come from the active set, never from snapshot items.
            ListingOutcome::Closed => {}
        }
    }

    if guard.allows_closures() {
        let mut missing: Vec<&ActiveListing> = active
            .values()
            .filter(|stored| !snapshot.contains_key(&stored.external_id))
            .collect();
        missing.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        plan.closures = missing
            .into_iter()
            .map(|stored| closure_for(stored, today))
            .collect();
    } else {
        let would_close = active
            .keys()
            .filter(|id| !snapshot.contains_key(*id))
            .count();
        let reason = guard.violation().map(|e| e.to_string()).unwrap_or_default();
        tracing::warn!(
            region = region_code,
            snapshot_len = snapshot.len(),
            active_len = active.len(),
            would_close,
            reason = reason.as_str(),
            "Closure step suppressed; snapshot not trusted for disappearance"
        );
    }

    Ok(plan)
}
