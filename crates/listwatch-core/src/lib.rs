//! Listwatch Core - Domain types, reconciliation and the collection pipeline.
//!
//! The crate holds everything that does not talk to the network or the
//! database directly: configuration, the error type, the traits behind which
//! I/O lives, and the phases of a region run.

pub mod collect;
pub mod config;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod models;
pub mod observer;
pub mod persist;
pub mod pipeline;
pub mod reconcile;
pub mod run;
pub mod traits;

pub use collect::{collect_region, CollectLimits, CollectedSnapshot, SnapshotBuilder, StopReason};
pub use config::{
    default_config_path, load_config, parse_config, ApiConfig, AppConfig, CollectConfig,
    CredentialConfig, DbConfig, FieldPointers, GeocodeConfig, HttpConfig, RegionEntry,
};
pub use enrich::{enrich_details, CoordinatePointers, EnrichOptions, EnrichmentReport};
pub use error::AppError;
pub use extract::Extracted;
pub use models::{
    ActiveListing, ActiveSet, AddressResult, ClosureHistoryEntry, ExternalId, ListingDetail,
    ListingSnapshot, ListingWrite, PriceHistoryEntry, StoredListing, CLOSE_REASON_DISAPPEARED,
};
pub use observer::{RunLogger, TracingObserver};
pub use persist::PersistStats;
pub use pipeline::CollectionService;
pub use reconcile::{reconcile, ClosureGuard, ClosurePolicy, ListingOutcome, ReconcilePlan};
pub use run::{
    BatchRunSummary, ClosureSuppression, RegionRunResult, RunContext, RunPhase, RunStats,
    RunStatus, SuppressionReason,
};
pub use traits::{Geocoder, InsertOutcome, ListingPage, ListingSource, ListingStore, RunObserver};
