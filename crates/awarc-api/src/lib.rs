//! Partner API client + paginated availability fetching for awarc.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use awarc_core::{AvailabilityPage, AvailabilityResult, Source};
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "awarc-api";

pub const DEFAULT_BASE_URL: &str = "https://seats.aero/partnerapi";
pub const AUTH_HEADER: &str = "Partner-Authorization";

#[derive(Debug, Error)]
pub enum ApiError {
    /// Non-retryable response (auth, malformed request). Never retried.
    #[error("upstream rejected the request ({status}) for {url}")]
    Rejected { status: u16, url: String },
    /// The rate limit did not clear within the retry budget.
    #[error("rate limit still in effect after {attempts} attempts for {url}")]
    Exhausted { attempts: usize, url: String },
    /// Transient network/server failures outlasted the retry budget.
    #[error("upstream unavailable after {attempts} attempts for {url}: {reason}")]
    Unavailable {
        attempts: usize,
        url: String,
        reason: String,
    },
    #[error("decoding upstream response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    RateLimited,
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Retry budget for explicit rate-limit signals, tracked separately from the
/// transient backoff budget.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_retries: usize,
    pub fallback_delay: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            fallback_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartnerConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub rate_limit: RateLimitPolicy,
    /// Fixed pacing delay before each request, the upstream's polite-client
    /// expectation of roughly one request per second.
    pub page_pause: Duration,
}

impl PartnerConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
            page_pause: Duration::from_secs(1),
        }
    }
}

/// Filters for the bulk-availability endpoint. `None` fields are omitted
/// from the request entirely.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityQuery {
    pub cabin: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub take: Option<u32>,
    pub skip: Option<u64>,
    pub cursor: Option<u64>,
}

impl AvailabilityQuery {
    fn params(&self, source: Source) -> Vec<(&'static str, String)> {
        let mut params = vec![("source", source.as_str().to_string())];
        if let Some(cabin) = &self.cabin {
            params.push(("cabin", cabin.clone()));
        }
        if let Some(date) = self.start_date {
            params.push(("start_date", date.format("%Y-%m-%d").to_string()));
        }
        if let Some(date) = self.end_date {
            params.push(("end_date", date.format("%Y-%m-%d").to_string()));
        }
        if let Some(take) = self.take {
            params.push(("take", take.to_string()));
        }
        if let Some(skip) = self.skip {
            params.push(("skip", skip.to_string()));
        }
        if let Some(cursor) = self.cursor {
            params.push(("cursor", cursor.to_string()));
        }
        params
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug)]
pub struct PartnerClient {
    client: reqwest::Client,
    config: PartnerConfig,
}

impl PartnerClient {
    pub fn new(config: PartnerConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    /// One bulk-availability request with rate-limit and transient retry
    /// handling. Non-retryable responses fail immediately.
    pub async fn bulk_availability(
        &self,
        source: Source,
        query: &AvailabilityQuery,
    ) -> Result<AvailabilityPage, ApiError> {
        let url = format!("{}/availability", self.config.base_url);
        if !self.config.page_pause.is_zero() {
            tokio::time::sleep(self.config.page_pause).await;
        }

        let mut transient_attempts = 0usize;
        let mut rate_limit_attempts = 0usize;
        loop {
            let result = self
                .client
                .get(&url)
                .header(AUTH_HEADER, &self.config.api_key)
                .query(&query.params(source))
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let final_url = resp.url().to_string();
                        return resp.json::<AvailabilityPage>().await.map_err(|source| {
                            ApiError::Decode {
                                url: final_url,
                                source,
                            }
                        });
                    }
                    match classify_status(status) {
                        RetryDisposition::RateLimited => {
                            rate_limit_attempts += 1;
                            if rate_limit_attempts > self.config.rate_limit.max_retries {
                                return Err(ApiError::Exhausted {
                                    attempts: rate_limit_attempts,
                                    url,
                                });
                            }
                            let delay = retry_after(resp.headers())
                                .unwrap_or(self.config.rate_limit.fallback_delay);
                            warn!(
                                attempt = rate_limit_attempts,
                                delay_ms = delay.as_millis() as u64,
                                "rate limited, pausing before retrying the same page"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDisposition::Retryable => {
                            transient_attempts += 1;
                            if transient_attempts > self.config.backoff.max_retries {
                                return Err(ApiError::Unavailable {
                                    attempts: transient_attempts,
                                    url,
                                    reason: format!("http status {status}"),
                                });
                            }
                            let delay = self.config.backoff.delay_for_attempt(transient_attempts - 1);
                            warn!(
                                attempt = transient_attempts,
                                status = status.as_u16(),
                                "transient upstream failure, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDisposition::NonRetryable => {
                            return Err(ApiError::Rejected {
                                status: status.as_u16(),
                                url,
                            });
                        }
                    }
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && transient_attempts < self.config.backoff.max_retries
                    {
                        transient_attempts += 1;
                        let delay = self.config.backoff.delay_for_attempt(transient_attempts - 1);
                        warn!(attempt = transient_attempts, error = %err, "request failed, backing off");
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(ApiError::Unavailable {
                            attempts: transient_attempts + 1,
                            url,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Forward-only pager over the bulk-availability result set. A fresh
    /// pager restarts from the first page; there is no persisted cursor.
    pub fn availability_pager(
        &self,
        source: Source,
        query: AvailabilityQuery,
        page_size: u32,
        start_skip: u64,
    ) -> AvailabilityPager<'_> {
        AvailabilityPager {
            client: self,
            source,
            query,
            page_size,
            skip: start_skip,
            exhausted: false,
        }
    }
}

/// Seam between the fetch side and the pipeline: anything that can yield
/// availability pages in order until the upstream runs dry.
#[async_trait]
pub trait AvailabilityFeed: Send {
    async fn next_page(&mut self) -> Result<Option<Vec<AvailabilityResult>>, ApiError>;
}

pub struct AvailabilityPager<'a> {
    client: &'a PartnerClient,
    source: Source,
    query: AvailabilityQuery,
    page_size: u32,
    skip: u64,
    exhausted: bool,
}

#[async_trait]
impl AvailabilityFeed for AvailabilityPager<'_> {
    async fn next_page(&mut self) -> Result<Option<Vec<AvailabilityResult>>, ApiError> {
        if self.exhausted {
            return Ok(None);
        }
        let mut query = self.query.clone();
        query.take = Some(self.page_size);
        query.skip = Some(self.skip);

        let page = self.client.bulk_availability(self.source, &query).await?;
        debug!(
            source = %self.source,
            skip = self.skip,
            records = page.data.len(),
            has_more = page.has_more,
            "fetched availability page"
        );
        if page.data.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        self.skip += page.data.len() as u64;
        if !page.has_more {
            self.exhausted = true;
        }
        Ok(Some(page.data))
    }
}
