//! PostgreSQL persistence for listwatch.
//!
//! - [`ListingRepository`]: listings and their price and closure history
//! - [`RunRepository`]: the `collection_runs` log, as a run observer
//! - [`run_migrations`]: embedded schema migrations

pub mod migrations;
pub mod repository;
pub mod runs;

pub use migrations::run_migrations;
pub use repository::ListingRepository;
pub use runs::{status_for, RunRecord, RunRepository};
