//! Run bookkeeping: per-region statistics, lifecycle phases and batch summaries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::reconcile::ListingOutcome;

/// Identity of one region run, shared with every observer event.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub region_code: String,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(region_code: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            region_code: region_code.to_string(),
            started_at: Utc::now(),
        }
    }
}

/// Phase boundaries at which progress is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Collect,
    Enrich,
    Reconcile,
    Persist,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Collect => "collect",
            RunPhase::Enrich => "enrich",
            RunPhase::Reconcile => "reconcile",
            RunPhase::Persist => "persist",
        }
    }
}

/// Terminal status of a run as stored by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Why the closure step was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    BelowFloor,
    Incomplete,
}

/// Guard diagnostics kept with the run when closures were suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosureSuppression {
    pub reason: SuppressionReason,
    pub snapshot_len: usize,
    /// Smallest snapshot that would have allowed closures. Unset for
    /// incomplete snapshots, where no size is enough.
    pub required: Option<usize>,
    pub message: String,
}

/// Statistics for one region run.
///
/// Item-level failures land here instead of propagating as errors.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub pages_fetched: usize,
    pub page_failures: usize,
    pub shape_failures: usize,
    pub listings_collected: usize,
    /// False when any page failed, an item lacked an id, or the walk stopped early.
    pub snapshot_complete: bool,
    pub details_fetched: usize,
    pub details_degraded: usize,
    pub geocode_failures: usize,
    pub created: usize,
    pub changed: usize,
    pub seen: usize,
    pub closed: usize,
    pub reopened: usize,
    pub price_history_rows: usize,
    pub closure_history_rows: usize,
    pub persist_failures: usize,
    /// Set when the sanity floor or an incomplete snapshot suppressed closures.
    pub closures_suppressed: bool,
    pub closure_suppression: Option<ClosureSuppression>,
}

impl RunStats {
    /// Creates a new empty stats tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a reconciliation outcome, incrementing the appropriate counter.
    pub fn record(&mut self, outcome: ListingOutcome) {
        match outcome {
            ListingOutcome::New => self.created += 1,
            ListingOutcome::Changed => self.changed += 1,
            ListingOutcome::Seen => self.seen += 1,
            ListingOutcome::Closed => self.closed += 1,
        }
    }

    /// Listings present in the snapshot that were reconciled.
    pub fn reconciled(&self) -> usize {
        self.created + self.changed + self.seen
    }

    /// True when some item or batch was degraded but the run still finished.
    pub fn is_degraded(&self) -> bool {
        self.details_degraded > 0
            || self.shape_failures > 0
            || self.persist_failures > 0
            || self.closures_suppressed
            || !self.snapshot_complete
    }
}

/// Result of running a single region.
#[derive(Debug, Clone)]
pub struct RegionRunResult {
    pub region_code: String,
    pub stats: RunStats,
    /// Error message if the run failed, None if it completed.
    pub error: Option<String>,
    pub cancelled: bool,
}

impl RegionRunResult {
    pub fn success(region_code: String, stats: RunStats) -> Self {
        Self {
            region_code,
            stats,
            error: None,
            cancelled: false,
        }
    }

    pub fn failure(region_code: String, stats: RunStats, error: String) -> Self {
        Self {
            region_code,
            stats,
            error: Some(error),
            cancelled: false,
        }
    }

    pub fn cancelled(region_code: String, stats: RunStats) -> Self {
        Self {
            region_code,
            stats,
            error: None,
            cancelled: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

/// Aggregated results from running several regions.
#[derive(Debug, Clone, Default)]
pub struct BatchRunSummary {
    pub results: Vec<RegionRunResult>,
}

impl BatchRunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: RegionRunResult) {
        self.results.push(result);
    }

    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.results.iter().filter(|r| r.cancelled).count()
    }

    /// Listings reconciled across all regions.
    pub fn total_listings(&self) -> usize {
        self.results.iter().map(|r| r.stats.reconciled()).sum()
    }

    pub fn total_regions(&self) -> usize {
        self.results.len()
    }
}
