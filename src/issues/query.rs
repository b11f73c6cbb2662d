//! Read model over the issue cache. Never calls the remote tracker.

use super::{IssueRecord, IssueStore};
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;

pub const DEFAULT_LIMIT: usize = 200;
pub const MAX_LIMIT: usize = 1000;

/// Conjunctive issue filter. Empty strings count as "no filter".
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IssueFilter {
    /// Case-insensitive substring over key, title and labels
    pub search: Option<String>,
    /// Exact priority name
    pub priority: Option<String>,
    /// Exact assignee display name
    pub assignee: Option<String>,
    pub limit: Option<usize>,
}

impl IssueFilter {
    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }

    pub fn matches(&self, issue: &IssueRecord) -> bool {
        if let Some(needle) = non_empty(&self.search) {
            let needle = needle.to_lowercase();
            let hit = issue.issue_key.to_lowercase().contains(&needle)
                || issue.title.to_lowercase().contains(&needle)
                || issue
                    .labels
                    .iter()
                    .any(|l| l.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }

        if let Some(priority) = non_empty(&self.priority) {
            if issue.priority.as_deref() != Some(priority) {
                return false;
            }
        }

        if let Some(assignee) = non_empty(&self.assignee) {
            if issue.assignee.as_deref() != Some(assignee) {
                return false;
            }
        }

        true
    }

    /// Filters an ordered snapshot and truncates it to the limit.
    pub fn apply(&self, issues: Vec<IssueRecord>) -> Vec<IssueRecord> {
        issues
            .into_iter()
            .filter(|issue| self.matches(issue))
            .take(self.effective_limit())
            .collect()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Serves issue queries for a user's connected site.
#[derive(Clone)]
pub struct IssueReadModel {
    credentials: Arc<CredentialStore>,
    issues: Arc<IssueStore>,
}

impl IssueReadModel {
    pub fn new(credentials: Arc<CredentialStore>, issues: Arc<IssueStore>) -> Self {
        Self {
            credentials,
            issues,
        }
    }

    /// Lists cached issues for the user's current site of `provider`.
    pub fn list_issues(
        &self,
        user_id: &str,
        provider: &str,
        filter: &IssueFilter,
    ) -> Result<Vec<IssueRecord>> {
        let record = self
            .credentials
            .get(user_id, provider)?
            .ok_or_else(|| Error::NotConnected {
                user_id: user_id.to_string(),
                provider: provider.to_string(),
            })?;

        let snapshot = self.issues.list(provider, &record.cloud_id)?;
        Ok(filter.apply(snapshot))
    }
}
