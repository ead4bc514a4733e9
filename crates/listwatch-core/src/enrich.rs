//! Concurrent detail enrichment.
//!
//! Details are fetched through a fixed-size pool (`buffer_unordered`), and
//! the whole phase completes before reconciliation starts. A failed detail
//! keeps the listing with its list-level fields only; nothing is dropped.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::GeocodeConfig;
use crate::extract::{extract_f64, Extracted};
use crate::models::{AddressResult, ExternalId, ListingDetail, ListingSnapshot};
use crate::traits::{Geocoder, ListingSource};

/// JSON pointers to coordinates inside a detail payload.
#[derive(Debug, Clone)]
pub struct CoordinatePointers {
    pub latitude: String,
    pub longitude: String,
}

impl CoordinatePointers {
    /// Both pointers must be configured for geocoding to run.
    pub fn from_config(config: &GeocodeConfig) -> Option<Self> {
        match (&config.latitude_pointer, &config.longitude_pointer) {
            (Some(lat), Some(lon)) => Some(Self {
                latitude: lat.clone(),
                longitude: lon.clone(),
            }),
            _ => None,
        }
    }
}

/// Enrichment settings for one run.
#[derive(Clone, Copy)]
pub struct EnrichOptions<'a> {
    pub concurrency: usize,
    pub geocoder: Option<&'a dyn Geocoder>,
    pub coordinates: Option<&'a CoordinatePointers>,
}

/// Merged result of the enrichment phase.
#[derive(Debug)]
pub struct EnrichmentReport {
    /// Every input listing, enriched where the detail fetch succeeded.
    pub listings: HashMap<ExternalId, ListingSnapshot>,
    pub fetched: usize,
    pub degraded: usize,
    pub geocode_failures: usize,
    /// Listings left un-enriched because the run was cancelled.
    pub skipped: usize,
}

enum DetailOutcome {
    Fetched {
        detail: ListingDetail,
        geocode_failed: bool,
    },
    Failed,
    Skipped,
}

async fn resolve_address(
    payload: &serde_json::Value,
    geocoder: Option<&dyn Geocoder>,
    pointers: Option<&CoordinatePointers>,
    external_id: &str,
) -> (Option<AddressResult>, bool) {
    let (Some(geocoder), Some(pointers)) = (geocoder, pointers) else {
        return (None, false);
    };

    let lat = extract_f64(payload, &pointers.latitude);
    let lon = extract_f64(payload, &pointers.longitude);
    let (Extracted::Present(lat), Extracted::Present(lon)) = (lat, lon) else {
        return (None, false);
    };

    match geocoder.convert_coordinate_to_address(lat, lon).await {
        Ok(address) => (Some(address), false),
        Err(e) => {
            tracing::debug!(
                listing = external_id,
                lat,
                lon,
                error = %e,
                "Geocoding failed, keeping detail without address"
            );
            (None, true)
        }
    }
}

/// Fetches details for every listing of a snapshot.
///
/// Cancellation stops scheduling new fetches and abandons the ones in
/// flight; their listings keep list-level fields and count as skipped.
pub async fn enrich_details<S>(
    source: &S,
    snapshot: HashMap<ExternalId, ListingSnapshot>,
    options: EnrichOptions<'_>,
    cancel: &CancellationToken,
) -> EnrichmentReport
where
    S: ListingSource + ?Sized,
{
    let total = snapshot.len();
    let concurrency = options.concurrency.max(1);

    let outcomes: Vec<(ExternalId, DetailOutcome)> = stream::iter(snapshot.keys().cloned())
        .map(|id| async move {
            if cancel.is_cancelled() {
                return (id, DetailOutcome::Skipped);
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => return (id, DetailOutcome::Skipped),
                result = source.fetch_detail(&id) => result,
            };

            match fetched {
                Ok(payload) => {
                    let (address, geocode_failed) =
                        resolve_address(&payload, options.geocoder, options.coordinates, &id)
                            .await;
                    (
                        id,
                        DetailOutcome::Fetched {
                            detail: ListingDetail { payload, address },
                            geocode_failed,
                        },
                    )
                }
                Err(e) => {
                    tracing::warn!(
                        listing = id.as_str(),
                        error = %e,
                        "Detail fetch failed, keeping list-level fields"
                    );
                    (id, DetailOutcome::Failed)
                }
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut report = EnrichmentReport {
        listings: snapshot,
        fetched: 0,
        degraded: 0,
        geocode_failures: 0,
        skipped: 0,
    };

    for (id, outcome) in outcomes {
        match outcome {
            DetailOutcome::Fetched {
                detail,
                geocode_failed,
            } => {
                if let Some(listing) = report.listings.get_mut(&id) {
                    *listing = listing.with_detail(detail);
                }
                report.fetched += 1;
                if geocode_failed {
                    report.geocode_failures += 1;
                }
            }
            DetailOutcome::Failed => report.degraded += 1,
            DetailOutcome::Skipped => report.skipped += 1,
        }
    }

    tracing::info!(
        total,
        fetched = report.fetched,
        degraded = report.degraded,
        geocode_failures = report.geocode_failures,
        skipped = report.skipped,
        "Detail enrichment finished"
    );

    report
}
