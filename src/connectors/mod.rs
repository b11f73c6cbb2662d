//! Remote issue tracker clients.
//!
//! A tracker only knows how to fetch one page of issues with a given access
//! token. Token freshness, retries and pagination policy live in the sync
//! engine, so clients stay stateless.

pub mod jira;

use crate::issues::RawIssue;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// One page of search results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchPage {
    pub issues: Vec<RawIssue>,
    /// Total reported by the remote, when it reports one
    pub total: Option<usize>,
}

/// Why a page fetch failed, classified for the pager's retry policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("access token rejected")]
    Unauthorized,

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("search failed with status {status:?}: {body}")]
    Other { status: Option<u16>, body: String },
}

/// Issue tracker interface used by the sync engine.
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use issue_sync::connectors::{FetchError, IssueTracker, SearchPage};
///
/// struct EmptyTracker;
///
/// #[async_trait]
/// impl IssueTracker for EmptyTracker {
///     fn name(&self) -> &str {
///         "empty"
///     }
///
///     async fn search_page(
///         &self,
///         _access_token: &str,
///         _cloud_id: &str,
///         _start_at: usize,
///         _max_results: usize,
///     ) -> Result<SearchPage, FetchError> {
///         Ok(SearchPage::default())
///     }
/// }
/// ```
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Provider name, matching the OAuth provider and storage key (e.g. "jira").
    fn name(&self) -> &str;

    /// Fetches issues `[start_at, start_at + max_results)` of the configured search.
    async fn search_page(
        &self,
        access_token: &str,
        cloud_id: &str,
        start_at: usize,
        max_results: usize,
    ) -> Result<SearchPage, FetchError>;
}
