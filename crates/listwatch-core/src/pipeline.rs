//! Collection service: runs the phases of one region end to end.
//!
//! `collect → enrich → reconcile → persist`, each phase finishing before the
//! next starts. The service is generic over the upstream ([`ListingSource`])
//! and the store ([`ListingStore`]), so tests drive it with in-memory
//! implementations:
//!
//! ```ignore
//! use listwatch_core::pipeline::CollectionService;
//!
//! let service = CollectionService::new(client, repo, config.collect.clone())
//!     .with_logger(RunLogger::new().with_observer(Arc::new(TracingObserver)));
//! let summary = service.run_regions(&config.enabled_regions(), cancel).await;
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::collect::{collect_region, CollectLimits};
use crate::config::{CollectConfig, RegionEntry};
use crate::enrich::{enrich_details, CoordinatePointers, EnrichOptions};
use crate::error::AppError;
use crate::observer::RunLogger;
use crate::persist;
use crate::reconcile::{reconcile, ClosurePolicy};
use crate::run::{BatchRunSummary, RegionRunResult, RunContext, RunPhase, RunStats};
use crate::traits::{Geocoder, ListingSource, ListingStore};

/// Terminal state of a region run that did not fail.
enum RunEnd {
    Completed,
    Cancelled(RunPhase),
}

/// Pipeline service wiring a listing source to a listing store.
pub struct CollectionService<C, S>
where
    C: ListingSource,
    S: ListingStore,
{
    source: C,
    store: S,
    config: CollectConfig,
    policy: ClosurePolicy,
    geocoder: Option<Arc<dyn Geocoder>>,
    coordinates: Option<CoordinatePointers>,
    logger: RunLogger,
}

impl<C, S> CollectionService<C, S>
where
    C: ListingSource,
    S: ListingStore,
{
    pub fn new(source: C, store: S, config: CollectConfig) -> Self {
        let policy = ClosurePolicy::from_config(&config);
        Self {
            source,
            store,
            config,
            policy,
            geocoder: None,
            coordinates: None,
            logger: RunLogger::new(),
        }
    }

    /// Resolves addresses for details carrying coordinates at `pointers`.
    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>, pointers: CoordinatePointers) -> Self {
        self.geocoder = Some(geocoder);
        self.coordinates = Some(pointers);
        self
    }

    pub fn with_logger(mut self, logger: RunLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn source(&self) -> &C {
        &self.source
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one region at the current time.
    pub async fn run_region(&self, region: &RegionEntry, cancel: CancellationToken) -> RegionRunResult {
        self.run_region_at(region, cancel, Utc::now()).await
    }

    /// Runs one region as if it were `now`. Seen and closure dates derive
    /// from `now`.
    ///
    /// Never returns an error: phase failures are recorded on the result and
    /// reported to the observers as a failed run.
    pub async fn run_region_at(
        &self,
        region: &RegionEntry,
        cancel: CancellationToken,
        now: DateTime<Utc>,
    ) -> RegionRunResult {
        let run = RunContext::new(&region.code);
        let mut stats = RunStats::new();
        self.logger.start(&run).await;

        match self.execute(&run, region, &cancel, now, &mut stats).await {
            Ok(RunEnd::Completed) => {
                self.logger.complete(&run, &stats).await;
                RegionRunResult::success(region.code.clone(), stats)
            }
            Ok(RunEnd::Cancelled(phase)) => {
                tracing::info!(
                    region = region.code.as_str(),
                    phase = phase.as_str(),
                    "Run cancelled before persisting"
                );
                self.logger.failed(&run, &stats, &AppError::Cancelled).await;
                RegionRunResult::cancelled(region.code.clone(), stats)
            }
            Err(e) => {
                self.logger.failed(&run, &stats, &e).await;
                RegionRunResult::failure(region.code.clone(), stats, e.to_string())
            }
        }
    }

    async fn execute(
        &self,
        run: &RunContext,
        region: &RegionEntry,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
        stats: &mut RunStats,
    ) -> Result<RunEnd, AppError> {
        let deadline = self.config.run_timeout().map(|t| Instant::now() + t);
        let code = region.code.as_str();

        let limits = CollectLimits {
            max_pages: region.max_pages.or(self.config.max_pages),
            max_consecutive_failures: self.config.max_consecutive_page_failures,
        };
        let collected = collect_region(&self.source, code, limits, cancel).await?;
        stats.pages_fetched = collected.pages_fetched;
        stats.page_failures = collected.page_failures;
        stats.shape_failures = collected.shape_failures;
        stats.listings_collected = collected.listings.len();
        stats.snapshot_complete = collected.complete;
        self.logger.progress(run, RunPhase::Collect, stats).await;

        if cancel.is_cancelled() {
            return Ok(RunEnd::Cancelled(RunPhase::Collect));
        }
        check_deadline(deadline, RunPhase::Collect)?;

        let snapshot = if self.config.fetch_details && !collected.listings.is_empty() {
            let options = EnrichOptions {
                concurrency: self.config.detail_concurrency,
                geocoder: self.geocoder.as_deref(),
                coordinates: self.coordinates.as_ref(),
            };
            let report = enrich_details(&self.source, collected.listings, options, cancel).await;
            stats.details_fetched = report.fetched;
            stats.details_degraded = report.degraded;
            stats.geocode_failures = report.geocode_failures;
            self.logger.progress(run, RunPhase::Enrich, stats).await;

            if cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled(RunPhase::Enrich));
            }
            check_deadline(deadline, RunPhase::Enrich)?;
            report.listings
        } else {
            collected.listings
        };

        let active = self.store.find_active_ids(code).await?;
        let plan = reconcile(
            code,
            &snapshot,
            &active,
            &self.policy,
            collected.complete,
            now.date_naive(),
        )?;
        plan.record_into(stats);
        self.logger.progress(run, RunPhase::Reconcile, stats).await;

        if cancel.is_cancelled() {
            return Ok(RunEnd::Cancelled(RunPhase::Reconcile));
        }
        check_deadline(deadline, RunPhase::Reconcile)?;

        let persisted = persist::apply(&self.store, &plan, now).await;
        persisted.merge_into(stats);
        self.logger.progress(run, RunPhase::Persist, stats).await;

        Ok(RunEnd::Completed)
    }

    /// Runs several regions as independent pipelines.
    ///
    /// At most `region_concurrency` regions run at once. A failing region
    /// never affects the others; regions not started before cancellation are
    /// reported as cancelled.
    pub async fn run_regions(
        &self,
        regions: &[&RegionEntry],
        cancel: CancellationToken,
    ) -> BatchRunSummary {
        let concurrency = self.config.region_concurrency.max(1);
        tracing::info!(regions = regions.len(), concurrency, "Starting batch run");

        let results: Vec<RegionRunResult> = stream::iter(regions.iter().copied())
            .map(|region| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return RegionRunResult::cancelled(region.code.clone(), RunStats::new());
                    }
                    self.run_region(region, cancel).await
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = BatchRunSummary::new();
        for result in results {
            if let Some(error) = &result.error {
                tracing::warn!(
                    region = result.region_code.as_str(),
                    error = error.as_str(),
                    "Region run failed"
                );
            }
            summary.add(result);
        }

        tracing::info!(
            successful = summary.successful_count(),
            failed = summary.failed_count(),
            cancelled = summary.cancelled_count(),
            listings = summary.total_listings(),
            "Batch run finished"
        );
        summary
    }
}

fn check_deadline(deadline: Option<Instant>, phase: RunPhase) -> Result<(), AppError> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            Err(AppError::DeadlineExceeded(phase.as_str()))
        }
        _ => Ok(()),
    }
}
