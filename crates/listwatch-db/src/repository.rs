//! Listing repository for PostgreSQL.
//!
//! Every write is one statement over `UNNEST`ed column arrays, so a batch
//! costs a single round trip and only locks the rows it touches. Concurrent
//! region runs write disjoint ids and never wait on each other.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use listwatch_core::error::AppError;
use listwatch_core::models::{
    ActiveListing, ActiveSet, ClosureHistoryEntry, ExternalId, ListingWrite, PriceHistoryEntry,
    StoredListing,
};
use listwatch_core::traits::{InsertOutcome, ListingStore};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Pool, Postgres, Row};

/// Column list for SELECT queries. Must remain a const literal to ensure SQL safety
/// since format!() bypasses sqlx compile-time validation.
const LISTING_COLUMNS: &str = "external_id, region_code, trade_type, price, rent, area, detail, address, postal_code, is_active, first_seen_date, last_seen_date, closed_at, close_reason";

/// `UNNEST` source shared by the insert and update statements.
const LISTING_UNNEST: &str = r#"
    UNNEST(
        $1::text[], $2::text[], $3::text[], $4::int8[], $5::int8[],
        $6::float8[], $7::jsonb[], $8::text[], $9::text[], $10::date[]
    ) AS t(external_id, region_code, trade_type, price, rent, area, detail, address, postal_code, seen_date)
"#;

/// Repository for listings and their history in PostgreSQL.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use listwatch_db::ListingRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/listwatch")
///     .await?;
///
/// let repo = ListingRepository::new(pool);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ListingRepository {
    pool: Pool<Postgres>,
}

impl ListingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Retrieves one listing, active or closed.
    pub async fn get(&self, external_id: &str) -> Result<Option<StoredListing>, AppError> {
        let query = format!("SELECT {} FROM listings WHERE external_id = $1", LISTING_COLUMNS);
        let result = sqlx::query_as::<_, StoredListing>(&query)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        Ok(result)
    }
}

/// A batch of listing writes split into one array per column.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ListingColumns {
    pub external_ids: Vec<String>,
    pub region_codes: Vec<String>,
    pub trade_types: Vec<Option<String>>,
    pub prices: Vec<Option<i64>>,
    pub rents: Vec<Option<i64>>,
    pub areas: Vec<Option<f64>>,
    pub details: Vec<Option<Json<Value>>>,
    pub addresses: Vec<Option<String>>,
    pub postal_codes: Vec<Option<String>>,
    pub seen_dates: Vec<NaiveDate>,
}

impl ListingColumns {
    pub(crate) fn from_writes(batch: &[ListingWrite]) -> Self {
        let mut columns = Self::default();
        for write in batch {
            let listing = &write.listing;
            let address = listing.detail.as_ref().and_then(|d| d.address.as_ref());

            columns.external_ids.push(listing.external_id.clone());
            columns.region_codes.push(listing.region_code.clone());
            columns.trade_types.push(listing.trade_type.clone());
            columns.prices.push(listing.price);
            columns.rents.push(listing.rent);
            columns.areas.push(listing.area);
            columns
                .details
                .push(listing.detail.as_ref().map(|d| Json(d.payload.clone())));
            columns.addresses.push(address.map(|a| a.address.clone()));
            columns
                .postal_codes
                .push(address.and_then(|a| a.postal_code.clone()));
            columns.seen_dates.push(write.seen_date);
        }
        columns
    }

    fn bind<'q>(self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        query
            .bind(self.external_ids)
            .bind(self.region_codes)
            .bind(self.trade_types)
            .bind(self.prices)
            .bind(self.rents)
            .bind(self.areas)
            .bind(self.details)
            .bind(self.addresses)
            .bind(self.postal_codes)
            .bind(self.seen_dates)
    }
}

/// Ids of `batch` that are not in `inserted`, in batch order.
pub(crate) fn duplicates_of(batch: &[ListingWrite], inserted: &HashSet<String>) -> Vec<ExternalId> {
    batch
        .iter()
        .map(|w| &w.listing.external_id)
        .filter(|id| !inserted.contains(*id))
        .cloned()
        .collect()
}

#[async_trait]
impl ListingStore for ListingRepository {
    async fn find_active_ids(&self, region: &str) -> Result<ActiveSet, AppError> {
        let rows: Vec<ActiveListing> = sqlx::query_as(
            r#"
            SELECT external_id, trade_type, price, rent, first_seen_date, last_seen_date
            FROM listings
            WHERE region_code = $1 AND is_active
            "#,
        )
        .bind(region)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.external_id.clone(), row))
            .collect())
    }

    async fn find_existing_ids(&self, ids: &[ExternalId]) -> Result<HashSet<ExternalId>, AppError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT external_id FROM listings WHERE external_id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(AppError::DatabaseError)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn insert_listings(&self, batch: &[ListingWrite]) -> Result<InsertOutcome, AppError> {
        if batch.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let sql = format!(
            r#"
            INSERT INTO listings (
                external_id, region_code, trade_type, price, rent, area,
                detail, address, postal_code, is_active, first_seen_date, last_seen_date
            )
            SELECT
                t.external_id, t.region_code, t.trade_type, t.price, t.rent, t.area,
                t.detail, t.address, t.postal_code, TRUE, t.seen_date, t.seen_date
            FROM {}
            ON CONFLICT (external_id) DO NOTHING
            RETURNING external_id
            "#,
            LISTING_UNNEST
        );

        let rows = ListingColumns::from_writes(batch)
            .bind(sqlx::query(&sql))
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        let inserted = rows
            .iter()
            .map(|row| row.try_get::<String, _>("external_id"))
            .collect::<Result<HashSet<String>, _>>()
            .map_err(AppError::DatabaseError)?;
        Ok(InsertOutcome {
            inserted: inserted.len() as u64,
            duplicates: duplicates_of(batch, &inserted),
        })
    }

    async fn update_listings(&self, batch: &[ListingWrite]) -> Result<u64, AppError> {
        if batch.is_empty() {
            return Ok(0);
        }

        // Absent fresh values keep the stored ones; last_seen_date never moves back.
        let sql = format!(
            r#"
            UPDATE listings AS l SET
                region_code = t.region_code,
                trade_type = COALESCE(t.trade_type, l.trade_type),
                price = COALESCE(t.price, l.price),
                rent = COALESCE(t.rent, l.rent),
                area = COALESCE(t.area, l.area),
                detail = COALESCE(t.detail, l.detail),
                address = COALESCE(t.address, l.address),
                postal_code = COALESCE(t.postal_code, l.postal_code),
                is_active = TRUE,
                closed_at = NULL,
                close_reason = NULL,
                last_seen_date = GREATEST(l.last_seen_date, t.seen_date),
                updated_at = NOW()
            FROM {}
            WHERE l.external_id = t.external_id
            "#,
            LISTING_UNNEST
        );

        let result = ListingColumns::from_writes(batch)
            .bind(sqlx::query(&sql))
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn append_price_history(&self, batch: &[PriceHistoryEntry]) -> Result<u64, AppError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO price_history (
                external_id, previous_price, new_price, previous_rent, new_rent,
                previous_trade_type, new_trade_type, change_amount, change_percent, changed_date
            )
            SELECT * FROM UNNEST(
                $1::text[], $2::int8[], $3::int8[], $4::int8[], $5::int8[],
                $6::text[], $7::text[], $8::int8[], $9::float8[], $10::date[]
            )
            "#,
        )
        .bind(batch.iter().map(|e| e.external_id.clone()).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.previous_price).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.new_price).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.previous_rent).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.new_rent).collect::<Vec<_>>())
        .bind(
            batch
                .iter()
                .map(|e| e.previous_trade_type.clone())
                .collect::<Vec<_>>(),
        )
        .bind(batch.iter().map(|e| e.new_trade_type.clone()).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.change_amount).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.change_percent).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.changed_date).collect::<Vec<_>>())
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn append_closure_history(&self, batch: &[ClosureHistoryEntry]) -> Result<u64, AppError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO closure_history (
                external_id, days_active, final_price, close_reason, closed_date
            )
            SELECT * FROM UNNEST($1::text[], $2::int8[], $3::int8[], $4::text[], $5::date[])
            "#,
        )
        .bind(batch.iter().map(|e| e.external_id.clone()).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.days_active).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.final_price).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.close_reason.clone()).collect::<Vec<_>>())
        .bind(batch.iter().map(|e| e.closed_date).collect::<Vec<_>>())
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn close_listings(
        &self,
        ids: &[ExternalId],
        closed_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<ExternalId>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE listings
            SET is_active = FALSE, closed_at = $2, close_reason = $3, updated_at = NOW()
            WHERE external_id = ANY($1) AND is_active
            RETURNING external_id
            "#,
        )
        .bind(ids)
        .bind(closed_at)
        .bind(reason)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
