//! Sequential pagination over a tracker's search results.
//!
//! Handles the two recoverable page failures:
//! - 401: one refresh-and-retry of the same page, a second 401 is fatal
//! - 429: bounded exponential backoff, honouring `Retry-After`

use super::TokenSource;
use crate::connectors::{FetchError, IssueTracker};
use crate::error::{Error, Result};
use crate::issues::RawIssue;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 8000;

/// Backoff for rate-limited page requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries of one page
    pub max_retries: u32,
    /// Initial delay between retries (doubles each attempt)
    pub initial_delay: Duration,
    /// Maximum delay between retries, also caps `Retry-After`
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_MS)
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// `initial_delay * 2^attempt`, raised to `retry_after` if the remote
    /// asked for longer, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let backoff_ms = (self.initial_delay.as_millis() as u64).saturating_mul(factor);
        let backoff = Duration::from_millis(backoff_ms);
        let wanted = retry_after.map_or(backoff, |r| r.max(backoff));
        wanted.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub page_size: usize,
    pub retry: RetryConfig,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

/// Lazy, finite walk over every issue of one site.
///
/// Pages are fetched one at a time by [`next_page`](Self::next_page) until a
/// page comes back shorter than the page size. A fresh `Pager` restarts from
/// the first page.
pub struct Pager<'a> {
    tracker: &'a dyn IssueTracker,
    tokens: &'a dyn TokenSource,
    config: &'a PagerConfig,
    user_id: &'a str,
    cloud_id: String,
    access_token: String,
    start_at: usize,
    fetched: usize,
    pages: usize,
    done: bool,
}

impl<'a> Pager<'a> {
    pub fn new(
        tracker: &'a dyn IssueTracker,
        tokens: &'a dyn TokenSource,
        config: &'a PagerConfig,
        user_id: &'a str,
        cloud_id: String,
        access_token: String,
    ) -> Self {
        Self {
            tracker,
            tokens,
            config,
            user_id,
            cloud_id,
            access_token,
            start_at: 0,
            fetched: 0,
            pages: 0,
            done: false,
        }
    }

    /// Issues fetched so far.
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Fetches the next page, or `None` once the sequence is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawIssue>>> {
        if self.done {
            return Ok(None);
        }

        let page_size = self.config.page_size.max(1);
        let mut refreshed = false;
        let mut attempt = 0u32;

        loop {
            let result = self
                .tracker
                .search_page(&self.access_token, &self.cloud_id, self.start_at, page_size)
                .await;

            match result {
                Ok(page) => {
                    let count = page.issues.len();
                    self.start_at += count;
                    self.fetched += count;
                    self.pages += 1;

                    let reached_total = page.total.is_some_and(|total| self.start_at >= total);
                    if count < page_size || reached_total {
                        self.done = true;
                    }

                    debug!(
                        provider = self.tracker.name(),
                        page = self.pages,
                        count,
                        fetched = self.fetched,
                        "Fetched issue page"
                    );
                    return Ok(Some(page.issues));
                }
                Err(FetchError::Unauthorized) => {
                    if refreshed {
                        warn!(
                            provider = self.tracker.name(),
                            start_at = self.start_at,
                            "Refreshed token rejected, giving up"
                        );
                        return Err(Error::AuthExhausted {
                            fetched: self.fetched,
                        });
                    }
                    refreshed = true;

                    debug!(
                        provider = self.tracker.name(),
                        start_at = self.start_at,
                        "Access token rejected mid-sync, refreshing"
                    );
                    let fresh = self
                        .tokens
                        .refresh_rejected(self.user_id, self.tracker.name(), &self.access_token)
                        .await?;
                    self.access_token = fresh.access_token;
                }
                Err(FetchError::RateLimited { retry_after }) => {
                    if attempt >= self.config.retry.max_retries {
                        warn!(
                            provider = self.tracker.name(),
                            attempts = attempt + 1,
                            fetched = self.fetched,
                            "Rate limit retries exhausted"
                        );
                        return Err(Error::RateLimited {
                            fetched: self.fetched,
                        });
                    }

                    let delay = self.config.retry.delay_for_attempt(attempt, retry_after);
                    warn!(
                        provider = self.tracker.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(FetchError::Other { status, body }) => {
                    return Err(Error::Remote {
                        stage: "issue search",
                        status,
                        body,
                    });
                }
            }
        }
    }
}
