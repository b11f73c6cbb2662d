//! Jira Cloud issue search.

mod api;
mod transformer;

pub use api::{JiraClient, JiraIssue, JiraSearchResponse};
pub use transformer::issue_to_raw;

/// Default search: everything, newest changes first.
pub const DEFAULT_JQL: &str = "order by updated DESC";

/// Fields requested from the search endpoint.
pub const SEARCH_FIELDS: &str = "summary,status,priority,issuetype,assignee,labels,created,updated";
