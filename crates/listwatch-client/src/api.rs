//! Upstream listing API client.
//!
//! Maps the paginated list endpoint and the per-listing detail endpoint onto
//! [`ListingSource`]. Item fields are read through the JSON pointers of
//! [`ApiConfig`]; items without an id are skipped and counted, malformed
//! numeric fields are stored as unknown and counted.

use std::sync::Arc;

use async_trait::async_trait;
use listwatch_core::config::ApiConfig;
use listwatch_core::error::AppError;
use listwatch_core::extract::{extract_f64, extract_i64, extract_string, Extracted};
use listwatch_core::models::ListingSnapshot;
use listwatch_core::traits::{ListingPage, ListingSource};
use serde_json::Value;
use url::Url;

use crate::fetcher::{RateLimitedFetcher, RequestSpec};

/// HTTP implementation of [`ListingSource`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use listwatch_client::{CredentialStore, ListingApiClient, RateLimitedFetcher};
/// use listwatch_core::config::{ApiConfig, HttpConfig};
/// use listwatch_core::traits::ListingSource;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let api = ApiConfig {
///     base_url: "https://api.example.com/v1".to_string(),
///     ..ApiConfig::default()
/// };
/// let credentials = Arc::new(CredentialStore::in_memory(chrono::Duration::minutes(5)));
/// let fetcher = RateLimitedFetcher::new(&HttpConfig::default(), &api.user_agent, credentials)?;
/// let client = ListingApiClient::new(&api, Arc::new(fetcher))?;
///
/// let page = client.fetch_page("1168000000", 1).await?;
/// println!("{} listings on page 1", page.listings.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ListingApiClient {
    fetcher: Arc<RateLimitedFetcher>,
    base_url: Url,
    api: ApiConfig,
}

impl ListingApiClient {
    /// # Errors
    ///
    /// Returns `AppError::InvalidUrl` if `api.base_url` cannot be parsed.
    pub fn new(api: &ApiConfig, fetcher: Arc<RateLimitedFetcher>) -> Result<Self, AppError> {
        // A trailing slash keeps any base path when joining endpoint paths.
        let normalized = format!("{}/", api.base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|_| AppError::InvalidUrl(format!("Invalid API URL: {}", api.base_url)))?;

        Ok(Self {
            fetcher,
            base_url,
            api: api.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| AppError::InvalidUrl(e.to_string()))
    }

    pub fn list_url(&self, region: &str, page: u32) -> Result<Url, AppError> {
        let mut url = self.endpoint(&self.api.list_path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(&self.api.region_param, region);
            query.append_pair(&self.api.page_param, &page.to_string());
            if let (Some(param), Some(size)) = (&self.api.page_size_param, self.api.page_size) {
                query.append_pair(param, &size.to_string());
            }
        }
        Ok(url)
    }

    pub fn detail_url(&self, external_id: &str) -> Result<Url, AppError> {
        let encoded: String = url::form_urlencoded::byte_serialize(external_id.as_bytes()).collect();
        self.endpoint(&self.api.detail_path.replace("{id}", &encoded))
    }

    /// Maps one list response body.
    ///
    /// # Errors
    ///
    /// `AppError::UpstreamShape` when the items array is missing.
    pub fn map_page(&self, region: &str, body: &Value) -> Result<ListingPage, AppError> {
        let items = body
            .pointer(&self.api.items_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                AppError::UpstreamShape(format!(
                    "no items array at '{}' in list response",
                    self.api.items_pointer
                ))
            })?;

        let mut page = ListingPage {
            listings: Vec::with_capacity(items.len()),
            shape_failures: 0,
            dropped: 0,
            has_more: self
                .api
                .has_more_pointer
                .as_deref()
                .and_then(|p| body.pointer(p))
                .and_then(Value::as_bool),
        };

        for item in items {
            match self.map_item(region, item) {
                Ok((listing, malformed)) => {
                    page.shape_failures += malformed;
                    page.listings.push(listing);
                }
                Err(reason) => {
                    tracing::debug!(region, reason = reason.as_str(), "Skipping list item");
                    page.shape_failures += 1;
                    page.dropped += 1;
                }
            }
        }

        Ok(page)
    }

    /// Maps one list item. Returns the listing and the number of malformed
    /// optional fields, or why the item cannot be used at all.
    fn map_item(&self, region: &str, item: &Value) -> Result<(ListingSnapshot, usize), String> {
        let fields = &self.api.fields;
        let external_id = match extract_string(item, &fields.id) {
            Extracted::Present(id) => id,
            Extracted::Absent => return Err(format!("missing id at '{}'", fields.id)),
            Extracted::Malformed(reason) => return Err(reason),
        };

        let mut malformed = 0;
        let trade_type = keep(extract_string(item, &fields.trade_type), &mut malformed, &external_id);
        let price = keep(extract_i64(item, &fields.price), &mut malformed, &external_id);
        let rent = keep(extract_i64(item, &fields.rent), &mut malformed, &external_id);
        let area = keep(extract_f64(item, &fields.area), &mut malformed, &external_id);

        Ok((
            ListingSnapshot {
                external_id,
                region_code: region.to_string(),
                trade_type,
                price,
                rent,
                area,
                detail: None,
            },
            malformed,
        ))
    }
}

/// Keeps a present field; a malformed one is counted and stored as unknown.
fn keep<T>(value: Extracted<T>, malformed: &mut usize, external_id: &str) -> Option<T> {
    match value {
        Extracted::Present(v) => Some(v),
        Extracted::Absent => None,
        Extracted::Malformed(reason) => {
            tracing::debug!(listing = external_id, reason = reason.as_str(), "Malformed field");
            *malformed += 1;
            None
        }
    }
}

#[async_trait]
impl ListingSource for ListingApiClient {
    async fn fetch_page(&self, region: &str, page: u32) -> Result<ListingPage, AppError> {
        let url = self.list_url(region, page)?;
        let body = self.fetcher.request(&RequestSpec::list(url)).await?;
        self.map_page(region, &body)
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<Value, AppError> {
        let url = self.detail_url(external_id)?;
        let mut body = self.fetcher.request(&RequestSpec::detail(url)).await?;
        if self.api.detail_pointer.is_empty() {
            return Ok(body);
        }
        body.pointer_mut(&self.api.detail_pointer)
            .map(Value::take)
            .ok_or_else(|| {
                AppError::UpstreamShape(format!(
                    "no detail at '{}' for listing {}",
                    self.api.detail_pointer, external_id
                ))
            })
    }
}
