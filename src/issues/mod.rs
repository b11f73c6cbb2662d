//! Local mirror of remote tracker issues.
//!
//! - [`RawIssue`]: what a tracker client hands back, every field optional
//! - [`normalize`]: the total mapping from raw issues to [`IssueRecord`]
//! - [`IssueStore`]: SQLite cache keyed by `(provider, cloud_id, issue_key)`
//! - [`IssueReadModel`]: filtered queries over the cache

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

mod normalize;
mod query;
mod store;

pub use normalize::{normalize, StatusMap};
pub use query::{IssueFilter, IssueReadModel, DEFAULT_LIMIT, MAX_LIMIT};
pub use store::IssueStore;

/// Normalized workflow state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueState {
    Open,
    InProgress,
    Done,
    Other,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueState::Open => "OPEN",
            IssueState::InProgress => "IN_PROGRESS",
            IssueState::Done => "DONE",
            IssueState::Other => "OTHER",
        }
    }

    /// Parses the stored form. Anything unknown is `Other`, never an error.
    pub fn parse(s: &str) -> Self {
        match s {
            "OPEN" => IssueState::Open,
            "IN_PROGRESS" => IssueState::InProgress,
            "DONE" => IssueState::Done,
            _ => IssueState::Other,
        }
    }
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached issue as served to the presentation layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    #[serde(rename = "issueKey")]
    pub issue_key: String,
    pub title: String,
    pub state: IssueState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub issue_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub labels: BTreeSet<String>,
    #[serde(rename = "createdAtISO", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(rename = "updatedAtISO", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Provider-neutral issue as fetched from a remote tracker.
///
/// Remote JSON is loose; nothing here is assumed present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawIssue {
    pub key: Option<String>,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub issue_type: Option<String>,
    pub assignee: Option<String>,
    pub labels: Option<Vec<String>>,
    pub created: Option<String>,
    pub updated: Option<String>,
}
