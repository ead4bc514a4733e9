//! Embedded schema migrations.

use listwatch_core::error::AppError;
use sqlx::PgPool;

/// Applies every pending migration from `migrations/`.
///
/// Migrations are embedded at compile time and run in filename order.
///
/// # Errors
///
/// Returns `AppError::DatabaseError` if a migration fails to apply.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    tracing::info!("Running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))?;

    tracing::info!("Migrations completed");
    Ok(())
}
