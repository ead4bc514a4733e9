//! Run log persisted to `collection_runs`.

use async_trait::async_trait;
use chrono::Utc;
use listwatch_core::error::AppError;
use listwatch_core::run::{RunContext, RunPhase, RunStats, RunStatus};
use listwatch_core::traits::RunObserver;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// One row of `collection_runs`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    pub id: Uuid,
    pub region_code: String,
    pub status: String,
    pub phase: Option<String>,
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
    pub stats: Option<Json<serde_json::Value>>,
    pub error: Option<String>,
}

/// Terminal status stored for a run that ended with `error`.
pub fn status_for(error: &AppError) -> RunStatus {
    match error {
        AppError::Cancelled => RunStatus::Cancelled,
        _ => RunStatus::Failed,
    }
}

/// [`RunObserver`] that keeps one row per region run.
#[derive(Clone)]
pub struct RunRepository {
    pool: Pool<Postgres>,
}

impl RunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent runs, newest first, optionally for one region.
    pub async fn recent(
        &self,
        region: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RunRecord>, AppError> {
        let rows = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT id, region_code, status, phase, started_at, finished_at, stats, error
            FROM collection_runs
            WHERE $1::text IS NULL OR region_code = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(region)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows)
    }

    async fn finish(
        &self,
        run: &RunContext,
        status: RunStatus,
        stats: &RunStats,
        error: Option<String>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE collection_runs
            SET status = $2, stats = $3, error = $4, finished_at = $5
            WHERE id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(status.as_str())
        .bind(Json(stats))
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(())
    }
}

#[async_trait]
impl RunObserver for RunRepository {
    async fn on_run_start(&self, run: &RunContext) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO collection_runs (id, region_code, status, started_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.region_code)
        .bind(RunStatus::Running.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(())
    }

    async fn on_run_progress(
        &self,
        run: &RunContext,
        phase: RunPhase,
        stats: &RunStats,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE collection_runs SET phase = $2, stats = $3 WHERE id = $1")
            .bind(run.run_id)
            .bind(phase.as_str())
            .bind(Json(stats))
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        Ok(())
    }

    async fn on_run_complete(&self, run: &RunContext, stats: &RunStats) -> Result<(), AppError> {
        self.finish(run, RunStatus::Completed, stats, None).await
    }

    async fn on_run_failed(
        &self,
        run: &RunContext,
        stats: &RunStats,
        error: &AppError,
    ) -> Result<(), AppError> {
        self.finish(run, status_for(error), stats, Some(error.to_string()))
            .await
    }
}
