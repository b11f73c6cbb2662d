use super::{IssueRecord, IssueState, RawIssue};
use std::collections::{BTreeSet, HashMap};

/// Built-in status vocabulary (Jira defaults). Keys are compared lowercased.
const DEFAULT_STATUSES: &[(&str, IssueState)] = &[
    ("to do", IssueState::Open),
    ("open", IssueState::Open),
    ("backlog", IssueState::Open),
    ("selected for development", IssueState::Open),
    ("reopened", IssueState::Open),
    ("in progress", IssueState::InProgress),
    ("in review", IssueState::InProgress),
    ("in development", IssueState::InProgress),
    ("done", IssueState::Done),
    ("closed", IssueState::Done),
    ("resolved", IssueState::Done),
];

/// Lookup table from remote status names to [`IssueState`].
///
/// Matching is case-insensitive and ignores surrounding whitespace.
/// Unknown or missing statuses map to `Other`.
#[derive(Clone, Debug)]
pub struct StatusMap {
    entries: HashMap<String, IssueState>,
}

impl Default for StatusMap {
    fn default() -> Self {
        Self {
            entries: DEFAULT_STATUSES
                .iter()
                .map(|(name, state)| (name.to_string(), *state))
                .collect(),
        }
    }
}

impl StatusMap {
    /// Default table with `overrides` layered on top.
    pub fn with_overrides<I, S>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (S, IssueState)>,
        S: AsRef<str>,
    {
        let mut map = Self::default();
        for (name, state) in overrides {
            map.entries.insert(fold(name.as_ref()), state);
        }
        map
    }

    pub fn state_for(&self, status: Option<&str>) -> IssueState {
        status
            .and_then(|s| self.entries.get(&fold(s)))
            .copied()
            .unwrap_or(IssueState::Other)
    }
}

fn fold(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Converts a raw remote issue into the local schema.
///
/// Returns `None` only when the issue has no usable key, since such an
/// issue cannot be identified in the cache. Every other missing field
/// becomes absent (or empty for the title and labels).
pub fn normalize(raw: &RawIssue, statuses: &StatusMap) -> Option<IssueRecord> {
    let issue_key = raw
        .key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())?
        .to_string();

    let labels: BTreeSet<String> = raw
        .labels
        .iter()
        .flatten()
        .filter(|l| !l.is_empty())
        .cloned()
        .collect();

    Some(IssueRecord {
        issue_key,
        title: raw.summary.clone().unwrap_or_default(),
        state: statuses.state_for(raw.status.as_deref()),
        priority: raw.priority.clone(),
        issue_type: raw.issue_type.clone(),
        assignee: raw.assignee.clone(),
        labels,
        created_at: raw.created.clone(),
        updated_at: raw.updated.clone(),
    })
}
