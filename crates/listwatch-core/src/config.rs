//! Configuration types for listwatch components.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file
//! (default `<config dir>/listwatch/config.toml`), then CLI flags. Every
//! section of the file is optional.
//!
//! ```toml
//! [api]
//! base_url = "https://api.example.com/v2"
//!
//! [collect]
//! closure_floor = 20
//!
//! [[regions]]
//! code = "1168000000"
//! name = "Gangnam"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Database connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// Root of the TOML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub http: HttpConfig,
    pub collect: CollectConfig,
    pub credentials: CredentialConfig,
    pub geocode: GeocodeConfig,
    pub db: DbConfig,
    pub regions: Vec<RegionEntry>,
}

impl AppConfig {
    /// Checks values that would otherwise fail deep inside a run.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.collect.detail_concurrency == 0 {
            return Err(AppError::ConfigError(
                "collect.detail_concurrency must be at least 1".to_string(),
            ));
        }
        if self.collect.region_concurrency == 0 {
            return Err(AppError::ConfigError(
                "collect.region_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(ratio) = self.collect.closure_min_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(AppError::ConfigError(format!(
                    "collect.closure_min_ratio must be within 0.0..=1.0, got {}",
                    ratio
                )));
            }
        }
        if self.http.rate_limit_per_second == 0 {
            return Err(AppError::ConfigError(
                "http.rate_limit_per_second must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for region in &self.regions {
            if region.code.trim().is_empty() {
                return Err(AppError::ConfigError("region code cannot be empty".to_string()));
            }
            if !seen.insert(region.code.as_str()) {
                return Err(AppError::ConfigError(format!(
                    "region '{}' is listed twice",
                    region.code
                )));
            }
        }
        Ok(())
    }

    /// Regions with `enabled = true`, in file order.
    pub fn enabled_regions(&self) -> Vec<&RegionEntry> {
        self.regions.iter().filter(|r| r.enabled).collect()
    }

    /// Looks a region up by code or by display name (case-insensitive).
    pub fn find_region(&self, key: &str) -> Option<&RegionEntry> {
        self.regions.iter().find(|r| {
            r.code == key
                || r.name
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(key))
        })
    }
}

/// Upstream listing API layout.
///
/// Item fields are addressed with JSON pointers (RFC 6901) relative to each
/// element of the items array, so the client stays agnostic of the exact
/// upstream payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub list_path: String,
    /// Detail path template; `{id}` is replaced with the external id.
    pub detail_path: String,
    pub region_param: String,
    pub page_param: String,
    pub page_size_param: Option<String>,
    pub page_size: Option<u32>,
    /// Pointer to the items array; empty string means the body is the array.
    pub items_pointer: String,
    /// Pointer to an explicit boolean "more data" flag, if the API has one.
    pub has_more_pointer: Option<String>,
    /// Pointer to the detail payload inside the detail response body.
    pub detail_pointer: String,
    pub fields: FieldPointers,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            list_path: "/listings".to_string(),
            detail_path: "/listings/{id}".to_string(),
            region_param: "region".to_string(),
            page_param: "page".to_string(),
            page_size_param: None,
            page_size: None,
            items_pointer: "/items".to_string(),
            has_more_pointer: Some("/hasMore".to_string()),
            detail_pointer: String::new(),
            fields: FieldPointers::default(),
            user_agent: "listwatch/0.1".to_string(),
        }
    }
}

/// JSON pointers to the list-level fields of one item.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FieldPointers {
    pub id: String,
    pub trade_type: String,
    pub price: String,
    pub rent: String,
    pub area: String,
}

impl Default for FieldPointers {
    fn default() -> Self {
        Self {
            id: "/id".to_string(),
            trade_type: "/tradeType".to_string(),
            price: "/price".to_string(),
            rent: "/rent".to_string(),
            area: "/area".to_string(),
        }
    }
}

/// HTTP client configuration for upstream calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub list_retry_base_ms: u64,
    pub detail_retry_base_ms: u64,
    pub rate_limit_per_second: u32,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn list_retry_base(&self) -> Duration {
        Duration::from_millis(self.list_retry_base_ms)
    }

    pub fn detail_retry_base(&self) -> Duration {
        Duration::from_millis(self.detail_retry_base_ms)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            list_retry_base_ms: 1500,
            detail_retry_base_ms: 500,
            rate_limit_per_second: 5,
        }
    }
}

/// Collection and reconciliation policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    /// Size of the detail worker pool.
    pub detail_concurrency: usize,
    pub fetch_details: bool,
    pub max_pages: Option<u32>,
    /// Consecutive failed pages that abort a region walk.
    pub max_consecutive_page_failures: u32,
    /// Snapshot size that must be exceeded before any closure is computed.
    pub closure_floor: usize,
    /// Optional minimum snapshot size relative to the currently active count.
    pub closure_min_ratio: Option<f64>,
    pub region_concurrency: usize,
    pub run_timeout_secs: Option<u64>,
}

impl CollectConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            detail_concurrency: 5,
            fetch_details: true,
            max_pages: None,
            max_consecutive_page_failures: 2,
            closure_floor: 10,
            closure_min_ratio: None,
            region_concurrency: 1,
            run_timeout_secs: None,
        }
    }
}

/// Credential pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Durable credential file; defaults to `<config dir>/listwatch/credentials.json`.
    pub file: Option<PathBuf>,
    /// Credentials expiring within this window are treated as expired.
    pub safety_margin_secs: i64,
    /// External command that mints a credential and prints it as JSON.
    pub acquire_command: Option<Vec<String>>,
    pub acquire_timeout_secs: u64,
}

impl CredentialConfig {
    pub fn file_path(&self) -> Option<PathBuf> {
        self.file
            .clone()
            .or_else(|| dirs::config_dir().map(|d| d.join("listwatch").join("credentials.json")))
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            file: None,
            safety_margin_secs: 300,
            acquire_command: None,
            acquire_timeout_secs: 120,
        }
    }
}

/// Where coordinates live inside a detail payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    pub latitude_pointer: Option<String>,
    pub longitude_pointer: Option<String>,
}

/// A region polled and reconciled independently.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionEntry {
    pub code: String,
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides `collect.max_pages` for this region.
    pub max_pages: Option<u32>,
}

impl RegionEntry {
    /// Display label used in logs.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.code)
    }
}

fn default_enabled() -> bool {
    true
}

/// Default configuration file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("listwatch").join("config.toml"))
}

/// Loads and validates the configuration file.
///
/// An explicit path must exist. Without one, the default location is used
/// when present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, AppError> {
    let resolved = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };

    let config = match resolved {
        Some(p) => {
            let raw = std::fs::read_to_string(&p).map_err(|e| {
                AppError::ConfigError(format!("cannot read {}: {}", p.display(), e))
            })?;
            parse_config(&raw)?
        }
        None => {
            tracing::debug!("No configuration file found, using defaults");
            AppConfig::default()
        }
    };

    config.validate()?;
    Ok(config)
}

/// Parses configuration from TOML text without validating it.
pub fn parse_config(raw: &str) -> Result<AppConfig, AppError> {
    toml::from_str(raw).map_err(|e| AppError::ConfigError(e.to_string()))
}
