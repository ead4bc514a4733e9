use thiserror::Error;

/// Application-wide error types.
///
/// This enum represents all errors that can occur while collecting and
/// reconciling listings. It uses the `thiserror` crate for ergonomic error
/// handling and automatic conversion from underlying library errors.
///
/// # Error Conversion
///
/// Some errors automatically convert from their source types using the `#[from]` attribute:
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Severity
///
/// Item-level variants (`UpstreamShape`, `PersistencePartialFailure`) are
/// counted into run statistics and never abort a run. Phase-level variants
/// (`CredentialUnavailable`, `Exhausted` at page level, `DatabaseError` on the
/// active-set query) abort the region run and are recorded as a failed run.
///
/// # Examples
///
/// ```no_run
/// use listwatch_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::ConfigError("collect.detail_concurrency must be at least 1".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// This error wraps all errors from SQLx database operations, including
    /// connection failures, query errors, and constraint violations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// HTTP client could not be built or a request could not be constructed.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration file missing, unreadable or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No valid credential in the pool and none could be acquired.
    ///
    /// Fatal for the current run; the next scheduled run may succeed once an
    /// operator or the acquisition command supplies a fresh credential.
    #[error("No credential available: {0}")]
    CredentialUnavailable(String),

    /// The upstream rejected the credential (HTTP 401).
    #[error("Credential rejected by upstream")]
    AuthExpired,

    /// Network or connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Non-2xx response other than 401 and 429.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Retry budget used up for a single request.
    #[error("Request to {url} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    /// HTTP 2xx with a body that does not have the expected shape.
    ///
    /// Soft failure: the affected item or page is skipped and counted.
    #[error("Unexpected upstream response shape: {0}")]
    UpstreamShape(String),

    /// One grouped write failed; the remaining batches still run.
    #[error("Persistence step '{step}' failed: {message}")]
    PersistencePartialFailure { step: &'static str, message: String },

    /// The snapshot is too small to be trusted for closures.
    #[error(
        "Snapshot of {snapshot_len} listings is below the closure floor of {floor}; closures suppressed"
    )]
    SanityFloorViolation { snapshot_len: usize, floor: usize },

    /// A page failed or the walk stopped early, so absence proves nothing.
    #[error("Snapshot of {snapshot_len} listings is incomplete; closures suppressed")]
    IncompleteSnapshot { snapshot_len: usize },

    /// The run was cancelled cooperatively.
    #[error("Run cancelled")]
    Cancelled,

    /// The overall run deadline passed at a phase boundary.
    #[error("Run deadline exceeded after phase '{0}'")]
    DeadlineExceeded(&'static str),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                        .to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::CredentialUnavailable(msg) => {
                format!(
                    "No usable credential: {}\n   Add one with: listwatch credentials add --token <TOKEN>\n   or configure credentials.acquire_command.",
                    msg
                )
            }
            AppError::AuthExpired => {
                "The upstream rejected the credential even after a refresh.\n   Check that the acquisition command mints valid tokens.".to_string()
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!("Request timed out after {} seconds.\n   The server may be overloaded. Try again later.", secs)
            }
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AppError::ConfigError(msg) => {
                format!("Configuration error: {}\n   Check the TOML file passed with --config.", msg)
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is retryable within the same request.
    ///
    /// # Examples
    ///
    /// ```
    /// use listwatch_core::error::AppError;
    ///
    /// let err = AppError::NetworkError("connection reset".to_string());
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::UpstreamShape("items missing".to_string());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::HttpStatus { .. }
        )
    }
}
