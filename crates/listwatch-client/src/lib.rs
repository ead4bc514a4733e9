//! Listwatch Client - upstream access for the collection pipeline
//!
//! This crate provides:
//!
//! - [`credentials`] - the shared credential pool and its acquisition command
//! - [`fetcher`] - rate-limited, retrying HTTP requests
//! - [`api`] - the listing API client implementing `ListingSource`
//!
//! # Overview
//!
//! One [`CredentialStore`] is shared through an `Arc` by the fetcher and all
//! regions of a run. The fetcher owns the retry policy; the API client only
//! builds URLs and maps response bodies.

pub mod api;
pub mod credentials;
pub mod fetcher;

pub use api::ListingApiClient;
pub use credentials::{
    read_credential_file, CommandIssuer, Credential, CredentialIssuer, CredentialStore,
};
pub use fetcher::{RateLimitedFetcher, RequestKind, RequestSpec, RetryPolicy};
