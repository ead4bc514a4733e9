//! Rate-limited, retrying HTTP fetcher for the upstream API.
//!
//! Every request waits on a shared requests-per-second quota, carries the
//! current credential as a bearer token and its own timeout. Retry policy:
//!
//! - network errors, timeouts and non-2xx statuses consume the retry budget,
//!   with a jittered, linearly growing delay ([`AppError::is_retryable`]);
//! - `401` refreshes the credential once and retries once, outside the budget;
//! - a `2xx` body that is not JSON is an [`AppError::UpstreamShape`], never retried;
//! - cancelling the fetcher's token interrupts a backoff sleep with
//!   [`AppError::Cancelled`].

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{clock::DefaultClock, state::InMemoryState, Jitter, Quota, RateLimiter};
use listwatch_core::config::HttpConfig;
use listwatch_core::error::AppError;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::credentials::CredentialStore;

/// Which retry base applies to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    List,
    Detail,
}

/// A single upstream GET.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub url: Url,
    pub kind: RequestKind,
}

impl RequestSpec {
    pub fn list(url: Url) -> Self {
        Self {
            url,
            kind: RequestKind::List,
        }
    }

    pub fn detail(url: Url) -> Self {
        Self {
            url,
            kind: RequestKind::Detail,
        }
    }
}

/// Retry budget and backoff bases.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub list_base: Duration,
    pub detail_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            list_base: config.list_retry_base(),
            detail_base: config.detail_retry_base(),
        }
    }

    fn base(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::List => self.list_base,
            RequestKind::Detail => self.detail_base,
        }
    }

    /// `base * retry`, plus up to half a base of random jitter.
    pub fn delay(&self, kind: RequestKind, retry: u32) -> Duration {
        let base = self.base(kind);
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base * retry + Duration::from_millis(jitter)
    }
}

/// HTTP fetcher shared by all list and detail requests of a process.
pub struct RateLimitedFetcher {
    client: Client,
    rate_limiter: RateLimiter<governor::state::NotKeyed, InMemoryState, DefaultClock>,
    credentials: Arc<CredentialStore>,
    retry: RetryPolicy,
    timeout_secs: u64,
    cancel: CancellationToken,
}

impl RateLimitedFetcher {
    /// # Errors
    ///
    /// `AppError::ConfigError` for a zero rate limit, `AppError::ClientError`
    /// if the HTTP client cannot be built.
    pub fn new(
        config: &HttpConfig,
        user_agent: &str,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, AppError> {
        let rps = NonZeroU32::new(config.rate_limit_per_second).ok_or_else(|| {
            AppError::ConfigError("http.rate_limit_per_second must be non-zero".to_string())
        })?;

        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(config.timeout())
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            rate_limiter: RateLimiter::direct(Quota::per_second(rps)),
            credentials,
            retry: RetryPolicy::from_config(config),
            timeout_secs: config.timeout_secs,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stops retry backoff once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Performs a GET and parses the body as JSON.
    ///
    /// # Errors
    ///
    /// - `AppError::CredentialUnavailable` when no credential can be obtained
    /// - `AppError::Exhausted` once the retry budget is spent, or when the
    ///   upstream rejects a freshly refreshed credential
    /// - `AppError::UpstreamShape` for a successful response with a non-JSON body
    /// - `AppError::Cancelled` when cancelled while waiting to retry
    pub async fn request(&self, spec: &RequestSpec) -> Result<Value, AppError> {
        let mut credential = self.credentials.acquire().await?;
        let mut refreshed = false;
        let mut attempts: u32 = 0;

        loop {
            self.rate_limiter
                .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(100)))
                .await;
            attempts += 1;

            let sent = self
                .client
                .get(spec.url.clone())
                .bearer_auth(&credential.token)
                .send()
                .await;

            let failure = match sent {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(body) => {
                        return serde_json::from_slice(&body).map_err(|e| {
                            AppError::UpstreamShape(format!(
                                "{}: response is not JSON: {}",
                                spec.url, e
                            ))
                        });
                    }
                    Err(e) => self.transport_error(e),
                },
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                    if refreshed {
                        return Err(AppError::Exhausted {
                            url: spec.url.to_string(),
                            attempts,
                            last_error: AppError::AuthExpired.to_string(),
                        });
                    }
                    tracing::warn!(
                        url = %spec.url,
                        credential = credential.fingerprint().as_str(),
                        "Credential rejected, refreshing"
                    );
                    credential = self.credentials.refresh_after(&credential).await?;
                    refreshed = true;
                    continue;
                }
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    AppError::RateLimitExceeded
                }
                Ok(resp) => AppError::HttpStatus {
                    status: resp.status().as_u16(),
                    url: spec.url.to_string(),
                },
                Err(e) => self.transport_error(e),
            };

            if !failure.is_retryable() {
                return Err(failure);
            }

            let retries_used = attempts - u32::from(refreshed);
            if retries_used > self.retry.max_retries {
                tracing::warn!(
                    url = %spec.url,
                    attempts,
                    error = %failure,
                    "Retry budget exhausted"
                );
                return Err(AppError::Exhausted {
                    url: spec.url.to_string(),
                    attempts,
                    last_error: failure.to_string(),
                });
            }

            let delay = self.retry.delay(spec.kind, retries_used);
            tracing::debug!(
                url = %spec.url,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Request failed, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AppError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {}", e))
        } else {
            AppError::NetworkError(e.to_string())
        }
    }
}
