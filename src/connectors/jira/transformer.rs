use super::api::JiraIssue;
use crate::issues::RawIssue;

/// Flattens a Jira search hit into a provider-neutral [`RawIssue`].
///
/// Nested objects (status, priority, issue type, assignee) contribute their
/// display name only.
pub fn issue_to_raw(issue: &JiraIssue) -> RawIssue {
    let fields = issue.fields.clone().unwrap_or_default();

    RawIssue {
        key: issue.key.clone(),
        summary: fields.summary,
        status: fields.status.and_then(|s| s.name),
        priority: fields.priority.and_then(|p| p.name),
        issue_type: fields.issuetype.and_then(|t| t.name),
        assignee: fields.assignee.and_then(|a| a.display_name),
        labels: fields.labels,
        created: fields.created,
        updated: fields.updated,
    }
}
