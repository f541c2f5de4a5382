//! HTTP client for the Moltbook public API
//!
//! Builds the reqwest client and fetches single pages with retry:
//! transient failures and rate limits are retried with exponential
//! backoff, everything else surfaces immediately. Rate limits run on
//! their own schedule, [`RATE_LIMIT_BACKOFF_FACTOR`] times slower than
//! the transient one.

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::ApiPage;

/// API and retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// API root, without trailing slash
    pub base_url: String,
    /// Posts requested per page
    pub page_size: usize,
    /// Upper bound on pages per feed per run
    pub max_pages: usize,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Retries after a transient failure, per page
    pub max_retries: u32,
    /// Retries after a rate-limit response, per page
    pub max_rate_limit_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Cap on a server-provided Retry-After hint
    pub max_retry_after_secs: u64,
    /// Submolt whose posts serve as agent introductions
    pub introductions_submolt: String,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.moltbook.com/api/v1".to_string(),
            page_size: 100,
            max_pages: 10,
            timeout_secs: 30,
            max_retries: 3,
            max_rate_limit_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_retry_after_secs: 300,
            introductions_submolt: "introductions".to_string(),
            user_agent: concat!("moltdex/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Scales the configured backoff bounds for rate-limit waits
pub const RATE_LIMIT_BACKOFF_FACTOR: u32 = 4;

/// Errors from fetching
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Rate limited on {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: u32 },

    #[error("Request to {url} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed page from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Whether running again later is expected to help
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. } | FetchError::RetriesExhausted { .. })
    }
}

/// Outcome of a single failed request
#[derive(Debug)]
enum Failure {
    RateLimited(Option<Duration>),
    Transient(String),
    Fatal(FetchError),
}

/// Create the HTTP client used for every API call
pub fn create_client(config: &FetchConfig) -> Result<Client, FetchError> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(config.user_agent.as_str())
        .build()
        .map_err(|e| FetchError::ClientBuild(e.to_string()))
}

/// Page-level API access with retry
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    config: FetchConfig,
}

impl ApiClient {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let http = create_client(&config)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    fn backoff(&self, factor: u32) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_backoff_ms) * factor)
            .with_max_interval(Duration::from_millis(self.config.max_backoff_ms) * factor)
            .with_max_elapsed_time(None)
            .build()
    }

    fn transient_backoff(&self) -> ExponentialBackoff {
        self.backoff(1)
    }

    /// Even at its lowest jitter a rate-limit wait outlasts the longest
    /// transient wait at the same attempt.
    fn rate_limit_backoff(&self) -> ExponentialBackoff {
        self.backoff(RATE_LIMIT_BACKOFF_FACTOR)
    }

    /// Fetch one page, retrying transient failures and rate limits
    pub async fn get_page(&self, url: &str) -> Result<ApiPage, FetchError> {
        let mut transient = self.transient_backoff();
        let mut limited = self.rate_limit_backoff();
        let mut transient_failures = 0u32;
        let mut rate_limited = 0u32;

        loop {
            let failure = match self.try_get_page(url).await {
                Ok(page) => return Ok(page),
                Err(failure) => failure,
            };

            let wait = match failure {
                Failure::Fatal(e) => {
                    error!(url, error = %e, "Page request failed");
                    return Err(e);
                }
                Failure::RateLimited(hint) => {
                    rate_limited += 1;
                    if rate_limited > self.config.max_rate_limit_retries {
                        error!(url, attempts = rate_limited, "Rate limit retries exhausted");
                        return Err(FetchError::RateLimited {
                            url: url.to_string(),
                            attempts: rate_limited,
                        });
                    }
                    let cap = Duration::from_secs(self.config.max_retry_after_secs);
                    let hinted = hint.map(|h| h.min(cap)).unwrap_or_default();
                    let wait = limited.next_backoff().unwrap_or(limited.max_interval).max(hinted);
                    warn!(
                        url,
                        attempt = rate_limited,
                        retry_in_ms = wait.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    wait
                }
                Failure::Transient(err) => {
                    transient_failures += 1;
                    if transient_failures > self.config.max_retries {
                        error!(url, error = %err, attempts = transient_failures, "Max retries exceeded");
                        return Err(FetchError::RetriesExhausted {
                            url: url.to_string(),
                            attempts: transient_failures,
                            last_error: err,
                        });
                    }
                    let wait = transient.next_backoff().unwrap_or(transient.max_interval);
                    warn!(
                        url,
                        error = %err,
                        attempt = transient_failures,
                        retry_in_ms = wait.as_millis() as u64,
                        "Page request failed, retrying"
                    );
                    wait
                }
            };

            tokio::time::sleep(wait).await;
        }
    }

    async fn try_get_page(&self, url: &str) -> Result<ApiPage, Failure> {
        debug!(url, "Fetching page");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Failure::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Failure::RateLimited(retry_after(&response)));
        }
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(Failure::Transient(format!("status {}", status)));
        }
        if !status.is_success() {
            return Err(Failure::Fatal(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Failure::Transient(e.to_string()))?;

        serde_json::from_str(&body).map_err(|source| {
            Failure::Fatal(FetchError::Decode {
                url: url.to_string(),
                source,
            })
        })
    }
}

/// Retry-After in delta-seconds form
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
