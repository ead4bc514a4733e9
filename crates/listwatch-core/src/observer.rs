//! Run logger: fans lifecycle events out to every registered observer.
//!
//! Observer failures are logged and swallowed; a broken run table or log
//! sink never changes the outcome of a collection run.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;
use crate::run::{RunContext, RunPhase, RunStats};
use crate::traits::RunObserver;

/// Ordered set of observers notified for every region run.
#[derive(Clone, Default)]
pub struct RunLogger {
    observers: Vec<Arc<dyn RunObserver>>,
}

impl RunLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub async fn start(&self, run: &RunContext) {
        for observer in &self.observers {
            if let Err(e) = observer.on_run_start(run).await {
                log_observer_error(run, "start", &e);
            }
        }
    }

    pub async fn progress(&self, run: &RunContext, phase: RunPhase, stats: &RunStats) {
        for observer in &self.observers {
            if let Err(e) = observer.on_run_progress(run, phase, stats).await {
                log_observer_error(run, phase.as_str(), &e);
            }
        }
    }

    pub async fn complete(&self, run: &RunContext, stats: &RunStats) {
        for observer in &self.observers {
            if let Err(e) = observer.on_run_complete(run, stats).await {
                log_observer_error(run, "complete", &e);
            }
        }
    }

    pub async fn failed(&self, run: &RunContext, stats: &RunStats, error: &AppError) {
        for observer in &self.observers {
            if let Err(e) = observer.on_run_failed(run, stats, error).await {
                log_observer_error(run, "failed", &e);
            }
        }
    }
}

fn log_observer_error(run: &RunContext, event: &str, error: &AppError) {
    tracing::warn!(
        run_id = %run.run_id,
        region = run.region_code.as_str(),
        event,
        error = %error,
        "Run observer failed, continuing"
    );
}

/// Writes run lifecycle events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

#[async_trait]
impl RunObserver for TracingObserver {
    async fn on_run_start(&self, run: &RunContext) -> Result<(), AppError> {
        tracing::info!(
            run_id = %run.run_id,
            region = run.region_code.as_str(),
            "Run started"
        );
        Ok(())
    }

    async fn on_run_progress(
        &self,
        run: &RunContext,
        phase: RunPhase,
        stats: &RunStats,
    ) -> Result<(), AppError> {
        tracing::debug!(
            run_id = %run.run_id,
            region = run.region_code.as_str(),
            phase = phase.as_str(),
            listings = stats.listings_collected,
            "Phase finished"
        );
        Ok(())
    }

    async fn on_run_complete(&self, run: &RunContext, stats: &RunStats) -> Result<(), AppError> {
        let elapsed = chrono::Utc::now() - run.started_at;
        if stats.is_degraded() {
            tracing::warn!(
                run_id = %run.run_id,
                region = run.region_code.as_str(),
                created = stats.created,
                changed = stats.changed,
                seen = stats.seen,
                closed = stats.closed,
                details_degraded = stats.details_degraded,
                shape_failures = stats.shape_failures,
                persist_failures = stats.persist_failures,
                closures_suppressed = stats.closures_suppressed,
                suppression = stats
                    .closure_suppression
                    .as_ref()
                    .map(|s| s.message.as_str())
                    .unwrap_or(""),
                elapsed_ms = elapsed.num_milliseconds(),
                "Run completed with degraded items"
            );
        } else {
            tracing::info!(
                run_id = %run.run_id,
                region = run.region_code.as_str(),
                created = stats.created,
                changed = stats.changed,
                seen = stats.seen,
                closed = stats.closed,
                elapsed_ms = elapsed.num_milliseconds(),
                "Run completed"
            );
        }
        Ok(())
    }

    async fn on_run_failed(
        &self,
        run: &RunContext,
        stats: &RunStats,
        error: &AppError,
    ) -> Result<(), AppError> {
        tracing::error!(
            run_id = %run.run_id,
            region = run.region_code.as_str(),
            pages = stats.pages_fetched,
            error = %error,
            "Run failed"
        );
        Ok(())
    }
}
