//! On-demand synchronization of remote issues into the local cache.
//!
//! `sync_now` loads the integration, makes sure its token is fresh, pages
//! through the remote search, normalizes and upserts every issue, and on
//! success stamps `last_sync_at`. A failure leaves already-upserted issues
//! in place and does not touch `last_sync_at`. Cached issues missing from
//! the remote are never deleted.

mod pager;

pub use pager::{
    Pager, PagerConfig, RetryConfig, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MAX_RETRIES, DEFAULT_PAGE_SIZE,
};

use crate::connectors::IssueTracker;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::issues::{normalize, IssueStore, StatusMap};
use crate::oauth::{FreshCredential, TokenManager};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Source of usable access tokens for the sync engine.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn ensure_fresh(&self, user_id: &str, provider: &str) -> Result<FreshCredential>;

    async fn refresh_rejected(
        &self,
        user_id: &str,
        provider: &str,
        rejected_token: &str,
    ) -> Result<FreshCredential>;
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn ensure_fresh(&self, user_id: &str, provider: &str) -> Result<FreshCredential> {
        TokenManager::ensure_fresh(self, user_id, provider).await
    }

    async fn refresh_rejected(
        &self,
        user_id: &str,
        provider: &str,
        rejected_token: &str,
    ) -> Result<FreshCredential> {
        TokenManager::refresh_rejected(self, user_id, provider, rejected_token).await
    }
}

/// Step at which a sync stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    LoadCredential,
    Refresh,
    Fetch,
    Upsert,
    Finalize,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStage::LoadCredential => "load_credential",
            SyncStage::Refresh => "refresh",
            SyncStage::Fetch => "fetch",
            SyncStage::Upsert => "upsert",
            SyncStage::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// Outcome of a completed sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Issues upserted into the cache
    pub synced: usize,
    /// Remote issues dropped for lacking a key
    pub skipped: usize,
    pub pages: usize,
}

/// A sync that stopped early. `synced` issues were already upserted.
#[derive(Error, Debug)]
#[error("sync failed at {stage} after {synced} issues: {error}")]
pub struct SyncFailure {
    pub stage: SyncStage,
    pub synced: usize,
    #[source]
    pub error: Error,
}

impl SyncFailure {
    fn at(stage: SyncStage, synced: usize, error: impl Into<Error>) -> Self {
        Self {
            stage,
            synced,
            error: error.into(),
        }
    }
}

pub struct SyncEngine {
    credentials: Arc<CredentialStore>,
    issues: Arc<IssueStore>,
    tokens: Arc<dyn TokenSource>,
    trackers: HashMap<String, Arc<dyn IssueTracker>>,
    statuses: StatusMap,
    pager: PagerConfig,
    running: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl SyncEngine {
    pub fn new(
        credentials: Arc<CredentialStore>,
        issues: Arc<IssueStore>,
        tokens: Arc<dyn TokenSource>,
        trackers: impl IntoIterator<Item = Arc<dyn IssueTracker>>,
        statuses: StatusMap,
        pager: PagerConfig,
    ) -> Self {
        Self {
            credentials,
            issues,
            tokens,
            trackers: trackers
                .into_iter()
                .map(|t| (t.name().to_string(), t))
                .collect(),
            statuses,
            pager,
            running: DashMap::new(),
        }
    }

    /// Runs one sync for `(user_id, provider)`.
    ///
    /// A second call while one is running fails with `SyncInProgress`. The
    /// work runs on its own task: if the caller stops waiting, the sync still
    /// finishes its current page and commits normally.
    pub async fn sync_now(
        self: &Arc<Self>,
        user_id: &str,
        provider: &str,
    ) -> std::result::Result<SyncReport, SyncFailure> {
        let guard = self.lock_for(user_id, provider).try_lock_owned().map_err(|_| {
            SyncFailure::at(
                SyncStage::LoadCredential,
                0,
                Error::SyncInProgress {
                    user_id: user_id.to_string(),
                    provider: provider.to_string(),
                },
            )
        })?;

        let engine = Arc::clone(self);
        let user_id = user_id.to_string();
        let provider = provider.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            engine.run(&user_id, &provider).await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(SyncFailure::at(
                SyncStage::Finalize,
                0,
                anyhow::anyhow!("sync task aborted: {}", e),
            )),
        }
    }

    fn lock_for(&self, user_id: &str, provider: &str) -> Arc<Mutex<()>> {
        let key = (user_id.to_string(), provider.to_string());
        Arc::clone(&*self.running.entry(key).or_default())
    }

    async fn run(
        &self,
        user_id: &str,
        provider: &str,
    ) -> std::result::Result<SyncReport, SyncFailure> {
        let result = self.run_stages(user_id, provider).await;
        match &result {
            Ok(report) => info!(
                provider,
                user_id,
                synced = report.synced,
                skipped = report.skipped,
                pages = report.pages,
                "Sync completed"
            ),
            Err(failure) => warn!(
                provider,
                user_id,
                stage = %failure.stage,
                synced = failure.synced,
                error = %failure.error,
                "Sync failed"
            ),
        }
        result
    }

    async fn run_stages(
        &self,
        user_id: &str,
        provider: &str,
    ) -> std::result::Result<SyncReport, SyncFailure> {
        let tracker = self.trackers.get(provider).ok_or_else(|| {
            SyncFailure::at(
                SyncStage::LoadCredential,
                0,
                Error::NotConnected {
                    user_id: user_id.to_string(),
                    provider: provider.to_string(),
                },
            )
        })?;

        let record = self
            .credentials
            .get(user_id, provider)
            .map_err(|e| SyncFailure::at(SyncStage::LoadCredential, 0, e))?
            .ok_or_else(|| {
                SyncFailure::at(
                    SyncStage::LoadCredential,
                    0,
                    Error::NotConnected {
                        user_id: user_id.to_string(),
                        provider: provider.to_string(),
                    },
                )
            })?;

        info!(provider, user_id, cloud_id = %record.cloud_id, "Starting sync");

        let fresh = self
            .tokens
            .ensure_fresh(user_id, provider)
            .await
            .map_err(|e| SyncFailure::at(SyncStage::Refresh, 0, e))?;
        let cloud_id = fresh.record.cloud_id.clone();

        let mut pager = Pager::new(
            tracker.as_ref(),
            self.tokens.as_ref(),
            &self.pager,
            user_id,
            cloud_id.clone(),
            fresh.access_token,
        );

        let mut synced = 0;
        let mut skipped = 0;
        while let Some(page) = pager
            .next_page()
            .await
            .map_err(|e| SyncFailure::at(SyncStage::Fetch, synced, e))?
        {
            for raw in &page {
                let Some(issue) = normalize(raw, &self.statuses) else {
                    skipped += 1;
                    debug!(provider, "Skipping remote issue without key");
                    continue;
                };
                self.issues
                    .upsert(provider, &cloud_id, &issue)
                    .map_err(|e| SyncFailure::at(SyncStage::Upsert, synced, e))?;
                synced += 1;
            }
        }

        self.credentials
            .touch_last_sync(user_id, provider, &cloud_id, Utc::now())
            .map_err(|e| SyncFailure::at(SyncStage::Finalize, synced, e))?;

        Ok(SyncReport {
            synced,
            skipped,
            pages: pager.pages(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{FetchError, SearchPage};
    use crate::credentials::IntegrationRecord;
    use crate::issues::{IssueState, RawIssue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const USER: &str = "u1";
    const CLOUD: &str = "cloud-1";

    /// Remote dataset plus scripted failures.
    struct ScriptedTracker {
        issues: Vec<RawIssue>,
        accepted_token: StdMutex<String>,
        /// Token rotates (old one starts failing) the first time this page is requested
        expire_at_page: Option<usize>,
        /// Every request for this page index or later gets 401
        reject_from_page: Option<usize>,
        /// Every request for this page index or later gets 429
        rate_limit_from_page: Option<usize>,
        /// 429s served before succeeding
        transient_rate_limits: AtomicUsize,
        calls: StdMutex<Vec<(String, usize)>>,
    }

    impl ScriptedTracker {
        fn new(issue_count: usize) -> Self {
            let issues = (1..=issue_count)
                .map(|i| RawIssue {
                    key: Some(format!("OPS-{}", i)),
                    summary: Some(format!("Issue {}", i)),
                    status: Some(if i % 2 == 0 { "Done" } else { "To Do" }.to_string()),
                    priority: Some("High".to_string()),
                    updated: Some(format!("2026-01-{:02}T00:00:00.000+0000", i)),
                    ..Default::default()
                })
                .collect();
            Self {
                issues,
                accepted_token: StdMutex::new("token-1".to_string()),
                expire_at_page: None,
                reject_from_page: None,
                rate_limit_from_page: None,
                transient_rate_limits: AtomicUsize::new(0),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl IssueTracker for ScriptedTracker {
        fn name(&self) -> &str {
            "jira"
        }

        async fn search_page(
            &self,
            access_token: &str,
            cloud_id: &str,
            start_at: usize,
            max_results: usize,
        ) -> std::result::Result<SearchPage, FetchError> {
            assert_eq!(cloud_id, CLOUD);
            let page = start_at / max_results;
            self.calls
                .lock()
                .unwrap()
                .push((access_token.to_string(), page));

            if self.expire_at_page == Some(page) {
                let mut accepted = self.accepted_token.lock().unwrap();
                if *accepted == "token-1" {
                    *accepted = "token-2".to_string();
                }
            }
            if self.reject_from_page.is_some_and(|p| page >= p)
                || *self.accepted_token.lock().unwrap() != access_token
            {
                return Err(FetchError::Unauthorized);
            }
            if self.rate_limit_from_page.is_some_and(|p| page >= p) {
                return Err(FetchError::RateLimited { retry_after: None });
            }
            if self
                .transient_rate_limits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FetchError::RateLimited {
                    retry_after: Some(Duration::from_millis(1)),
                });
            }

            let end = (start_at + max_results).min(self.issues.len());
            let issues = self.issues.get(start_at..end).unwrap_or_default().to_vec();
            Ok(SearchPage {
                issues,
                total: None,
            })
        }
    }

    /// Hands out token-1, then token-2, ... on each refresh.
    struct FakeTokens {
        credentials: Arc<CredentialStore>,
        current: StdMutex<usize>,
        refreshes: AtomicUsize,
    }

    impl FakeTokens {
        fn fresh(&self, user_id: &str, provider: &str) -> Result<FreshCredential> {
            let record = self
                .credentials
                .get(user_id, provider)?
                .ok_or_else(|| Error::NotConnected {
                    user_id: user_id.to_string(),
                    provider: provider.to_string(),
                })?;
            let access_token = format!("token-{}", *self.current.lock().unwrap());
            Ok(FreshCredential {
                record,
                access_token,
            })
        }
    }

    #[async_trait]
    impl TokenSource for FakeTokens {
        async fn ensure_fresh(&self, user_id: &str, provider: &str) -> Result<FreshCredential> {
            self.fresh(user_id, provider)
        }

        async fn refresh_rejected(
            &self,
            user_id: &str,
            provider: &str,
            rejected_token: &str,
        ) -> Result<FreshCredential> {
            {
                let mut current = self.current.lock().unwrap();
                if format!("token-{}", *current) == rejected_token {
                    *current += 1;
                    self.refreshes.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.fresh(user_id, provider)
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        tracker: Arc<ScriptedTracker>,
        tokens: Arc<FakeTokens>,
        credentials: Arc<CredentialStore>,
        issues: Arc<IssueStore>,
    }

    fn harness(tracker: ScriptedTracker, connected: bool) -> Harness {
        let credentials = Arc::new(CredentialStore::new(":memory:").unwrap());
        let issues = Arc::new(IssueStore::new(":memory:").unwrap());
        if connected {
            credentials
                .upsert(&IntegrationRecord {
                    user_id: USER.to_string(),
                    provider: "jira".to_string(),
                    cloud_id: CLOUD.to_string(),
                    site_name: "acme".to_string(),
                    site_url: "https://acme.atlassian.net".to_string(),
                    scopes: Default::default(),
                    access_token_enc: "ciphertext".to_string(),
                    refresh_token_enc: None,
                    expires_at: Utc::now(),
                    last_sync_at: None,
                    reauth_required: false,
                })
                .unwrap();
        }

        let tracker = Arc::new(tracker);
        let tokens = Arc::new(FakeTokens {
            credentials: Arc::clone(&credentials),
            current: StdMutex::new(1),
            refreshes: AtomicUsize::new(0),
        });
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&credentials),
            Arc::clone(&issues),
            Arc::clone(&tokens) as Arc<dyn TokenSource>,
            [Arc::clone(&tracker) as Arc<dyn IssueTracker>],
            StatusMap::default(),
            PagerConfig {
                page_size: 2,
                retry: RetryConfig::new(3, 1, 5),
            },
        ));

        Harness {
            engine,
            tracker,
            tokens,
            credentials,
            issues,
        }
    }

    fn last_sync(h: &Harness) -> Option<chrono::DateTime<Utc>> {
        h.credentials.get(USER, "jira").unwrap().unwrap().last_sync_at
    }

    #[tokio::test]
    async fn test_full_sync() {
        let h = harness(ScriptedTracker::new(5), true);

        let report = h.engine.sync_now(USER, "jira").await.unwrap();
        assert_eq!(
            report,
            SyncReport {
                synced: 5,
                skipped: 0,
                pages: 3
            }
        );

        let cached = h.issues.list("jira", CLOUD).unwrap();
        assert_eq!(cached.len(), 5);
        assert_eq!(cached[0].issue_key, "OPS-5");
        assert_eq!(cached[0].state, IssueState::Open);
        assert_eq!(cached[1].state, IssueState::Done);
        assert!(last_sync(&h).is_some());
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_on_empty_page() {
        let h = harness(ScriptedTracker::new(4), true);
        let report = h.engine.sync_now(USER, "jira").await.unwrap();
        assert_eq!(report.synced, 4);
        assert_eq!(report.pages, 3);
        assert_eq!(h.tracker.call_count(), 3);
    }

    #[tokio::test]
    async fn test_token_expiry_before_third_page_refreshes_once() {
        // 9 issues at 2 per page: five pages
        let mut tracker = ScriptedTracker::new(9);
        tracker.expire_at_page = Some(2);
        let h = harness(tracker, true);

        let report = h.engine.sync_now(USER, "jira").await.unwrap();
        assert_eq!(report.synced, 9);
        assert_eq!(report.pages, 5);
        assert_eq!(h.tokens.refreshes.load(Ordering::SeqCst), 1);

        let calls = h.tracker.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("token-1".to_string(), 0),
                ("token-1".to_string(), 1),
                ("token-1".to_string(), 2),
                ("token-2".to_string(), 2),
                ("token-2".to_string(), 3),
                ("token-2".to_string(), 4),
            ]
        );
        assert_eq!(h.issues.count("jira", CLOUD).unwrap(), 9);
        assert!(last_sync(&h).is_some());
    }

    #[tokio::test]
    async fn test_second_401_keeps_earlier_pages() {
        let mut tracker = ScriptedTracker::new(9);
        tracker.reject_from_page = Some(2);
        let h = harness(tracker, true);

        let failure = h.engine.sync_now(USER, "jira").await.unwrap_err();
        assert_eq!(failure.stage, SyncStage::Fetch);
        assert_eq!(failure.synced, 4);
        assert!(matches!(failure.error, Error::AuthExhausted { fetched: 4 }));
        assert!(failure.error.requires_reauth());

        assert_eq!(h.tokens.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(h.issues.count("jira", CLOUD).unwrap(), 4);
        assert!(last_sync(&h).is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_reports_partial() {
        let mut tracker = ScriptedTracker::new(9);
        tracker.rate_limit_from_page = Some(1);
        let h = harness(tracker, true);

        let failure = h.engine.sync_now(USER, "jira").await.unwrap_err();
        assert_eq!(failure.stage, SyncStage::Fetch);
        assert!(matches!(failure.error, Error::RateLimited { fetched: 2 }));
        // Page 0 once, page 1 initial attempt plus three retries
        assert_eq!(h.tracker.call_count(), 5);
        assert_eq!(h.issues.count("jira", CLOUD).unwrap(), 2);
        assert!(last_sync(&h).is_none());
    }

    #[tokio::test]
    async fn test_transient_rate_limit_recovers() {
        let tracker = ScriptedTracker::new(3);
        tracker.transient_rate_limits.store(2, Ordering::SeqCst);
        let h = harness(tracker, true);

        let report = h.engine.sync_now(USER, "jira").await.unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(h.tracker.call_count(), 4);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let h = harness(ScriptedTracker::new(7), true);

        h.engine.sync_now(USER, "jira").await.unwrap();
        let first = h.issues.list("jira", CLOUD).unwrap();
        h.engine.sync_now(USER, "jira").await.unwrap();
        let second = h.issues.list("jira", CLOUD).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.len(), 7);
    }

    #[tokio::test]
    async fn test_vanished_issues_are_kept() {
        let h = harness(ScriptedTracker::new(3), true);
        h.engine.sync_now(USER, "jira").await.unwrap();

        let shrunk = ScriptedTracker::new(1);
        let engine = SyncEngine::new(
            Arc::clone(&h.credentials),
            Arc::clone(&h.issues),
            Arc::clone(&h.tokens) as Arc<dyn TokenSource>,
            [Arc::new(shrunk) as Arc<dyn IssueTracker>],
            StatusMap::default(),
            PagerConfig {
                page_size: 2,
                retry: RetryConfig::new(3, 1, 5),
            },
        );
        Arc::new(engine).sync_now(USER, "jira").await.unwrap();

        assert_eq!(h.issues.count("jira", CLOUD).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_issue_without_key_is_skipped() {
        let mut tracker = ScriptedTracker::new(3);
        tracker.issues[1].key = None;
        let h = harness(tracker, true);

        let report = h.engine.sync_now(USER, "jira").await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let h = harness(ScriptedTracker::new(3), false);

        let failure = h.engine.sync_now(USER, "jira").await.unwrap_err();
        assert_eq!(failure.stage, SyncStage::LoadCredential);
        assert!(matches!(failure.error, Error::NotConnected { .. }));
        assert_eq!(h.tracker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sync_rejected() {
        let h = harness(ScriptedTracker::new(3), true);

        let lock = h.engine.lock_for(USER, "jira");
        let _held = lock.try_lock().unwrap();

        let failure = h.engine.sync_now(USER, "jira").await.unwrap_err();
        assert!(matches!(failure.error, Error::SyncInProgress { .. }));
        assert_eq!(h.tracker.call_count(), 0);

        // Other users are independent
        let other = h.engine.sync_now("someone-else", "jira").await.unwrap_err();
        assert!(matches!(other.error, Error::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_lock_released_after_sync() {
        let h = harness(ScriptedTracker::new(1), true);
        h.engine.sync_now(USER, "jira").await.unwrap();
        h.engine.sync_now(USER, "jira").await.unwrap();
    }

    #[test]
    fn test_stage_serialization() {
        assert_eq!(
            serde_json::to_value(SyncStage::LoadCredential).unwrap(),
            "load_credential"
        );
        assert_eq!(SyncStage::Finalize.to_string(), "finalize");
    }
}
