use super::{issue_to_raw, DEFAULT_JQL, SEARCH_FIELDS};
use crate::connectors::{FetchError, IssueTracker, SearchPage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Named Jira object (status, priority, issue type).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Named {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JiraUser {
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JiraFields {
    pub summary: Option<String>,
    pub status: Option<Named>,
    pub priority: Option<Named>,
    pub issuetype: Option<Named>,
    pub assignee: Option<JiraUser>,
    pub labels: Option<Vec<String>>,
    pub created: Option<String>,
    pub updated: Option<String>,
}

/// Jira issue as returned by the search endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct JiraIssue {
    pub key: Option<String>,
    pub fields: Option<JiraFields>,
}

/// Jira search response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraSearchResponse {
    #[serde(default)]
    pub issues: Vec<JiraIssue>,
    pub total: Option<usize>,
}

/// HTTP client for the Jira Cloud REST API, addressed through the
/// Atlassian API gateway (`{base}/ex/jira/{cloudId}`).
pub struct JiraClient {
    http_client: Client,
    base_url: String,
    jql: String,
}

impl JiraClient {
    pub fn new(base_url: String) -> Self {
        Self::with_jql(base_url, DEFAULT_JQL.to_string())
    }

    pub fn with_jql(base_url: String, jql: String) -> Self {
        let http_client = Client::builder()
            .user_agent(concat!("issue-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            jql,
        }
    }

    fn search_url(&self, cloud_id: &str) -> String {
        format!("{}/ex/jira/{}/rest/api/3/search", self.base_url, cloud_id)
    }
}

#[async_trait]
impl IssueTracker for JiraClient {
    fn name(&self) -> &str {
        "jira"
    }

    async fn search_page(
        &self,
        access_token: &str,
        cloud_id: &str,
        start_at: usize,
        max_results: usize,
    ) -> Result<SearchPage, FetchError> {
        let start_at = start_at.to_string();
        let max_results = max_results.to_string();
        let response = self
            .http_client
            .get(self.search_url(cloud_id))
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .query(&[
                ("jql", self.jql.as_str()),
                ("startAt", start_at.as_str()),
                ("maxResults", max_results.as_str()),
                ("fields", SEARCH_FIELDS),
            ])
            .send()
            .await
            .map_err(|e| FetchError::Other {
                status: None,
                body: e.to_string(),
            })?;

        check_response_status(response.status(), response.headers())?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Other {
                status: Some(status),
                body,
            });
        }

        let parsed: JiraSearchResponse = response.json().await.map_err(|e| FetchError::Other {
            status: None,
            body: format!("Failed to parse search response: {}", e),
        })?;

        Ok(SearchPage {
            issues: parsed.issues.iter().map(issue_to_raw).collect(),
            total: parsed.total,
        })
    }
}

/// Maps the statuses the pager reacts to.
///
/// - 401 → `Unauthorized` (token expired or revoked)
/// - 429 → `RateLimited`, with `Retry-After` seconds when present
fn check_response_status(
    status: StatusCode,
    headers: &reqwest::header::HeaderMap,
) -> Result<(), FetchError> {
    match status {
        StatusCode::UNAUTHORIZED => Err(FetchError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = headers
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(FetchError::RateLimited { retry_after })
        }
        _ => Ok(()),
    }
}
