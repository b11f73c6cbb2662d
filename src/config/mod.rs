//! Service configuration.
//!
//! Non-secret settings come from an optional TOML file (path in
//! `ISSUE_SYNC_CONFIG`); every section and field has a default. Secrets are
//! read from the environment only:
//! - `ISSUE_SYNC_ENCRYPTION_KEY`: base64 32-byte token encryption key
//! - `ISSUE_SYNC_OAUTH_{PROVIDER}_CLIENT_ID` / `_CLIENT_SECRET`

use crate::issues::{IssueState, StatusMap};
use crate::oauth::provider::{
    JIRA_API_BASE_URL, JIRA_AUDIENCE, JIRA_AUTH_URL, JIRA_RESOURCES_URL, JIRA_SCOPES,
    JIRA_TOKEN_URL,
};
use crate::oauth::ProviderConfig;
use crate::sync::{
    PagerConfig, RetryConfig, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES,
    DEFAULT_PAGE_SIZE,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

pub const CONFIG_PATH_ENV: &str = "ISSUE_SYNC_CONFIG";
pub const ENCRYPTION_KEY_ENV: &str = "ISSUE_SYNC_ENCRYPTION_KEY";

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueSyncConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Extra remote status names, e.g. `"In QA" = "IN_PROGRESS"`
    #[serde(default)]
    pub status_map: HashMap<String, IssueState>,
    #[serde(default)]
    pub jira: JiraConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public base URL the provider redirects back to
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Where the browser lands after a successful connection
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    /// Single-tenant user the integrations belong to
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_user_id() -> String {
    "default".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            callback_base_url: default_callback_base_url(),
            frontend_url: default_frontend_url(),
            user_id: default_user_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite file holding integrations and the issue cache
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "issue-sync.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// OAuth session and token lifetime settings
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: i64,
    #[serde(default = "default_session_cleanup_interval")]
    pub session_cleanup_interval_seconds: u64,
    /// Tokens expiring within this window are refreshed before use
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: i64,
    /// Lifetime assumed when the token endpoint omits `expires_in`
    #[serde(default = "default_expires_in")]
    pub default_expires_in_seconds: i64,
}

fn default_session_ttl() -> i64 {
    600
}

fn default_session_cleanup_interval() -> u64 {
    60
}

fn default_refresh_margin() -> i64 {
    90
}

fn default_expires_in() -> i64 {
    3600
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
            session_cleanup_interval_seconds: default_session_cleanup_interval(),
            refresh_margin_seconds: default_refresh_margin(),
            default_expires_in_seconds: default_expires_in(),
        }
    }
}

/// Paging and rate-limit backoff for syncs
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Search query; defaults to every issue, most recently updated first
    #[serde(default = "default_jql")]
    pub jql: String,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> u64 {
    DEFAULT_INITIAL_DELAY_MS
}

fn default_max_backoff() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_jql() -> String {
    crate::connectors::jira::DEFAULT_JQL.to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_rate_limit_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jql: default_jql(),
        }
    }
}

impl SyncConfig {
    pub fn pager_config(&self) -> PagerConfig {
        PagerConfig {
            page_size: self.page_size,
            retry: RetryConfig::new(
                self.max_rate_limit_retries,
                self.initial_backoff_ms,
                self.max_backoff_ms,
            ),
        }
    }
}

/// Jira Cloud endpoints. Overridable for staging tenants and tests.
#[derive(Debug, Clone, Deserialize)]
pub struct JiraConfig {
    #[serde(default = "default_jira_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_jira_token_url")]
    pub token_url: String,
    #[serde(default = "default_jira_resources_url")]
    pub resources_url: String,
    #[serde(default = "default_jira_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_jira_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_jira_audience")]
    pub audience: Option<String>,
}

fn default_jira_auth_url() -> String {
    JIRA_AUTH_URL.to_string()
}

fn default_jira_token_url() -> String {
    JIRA_TOKEN_URL.to_string()
}

fn default_jira_resources_url() -> String {
    JIRA_RESOURCES_URL.to_string()
}

fn default_jira_api_base_url() -> String {
    JIRA_API_BASE_URL.to_string()
}

fn default_jira_scopes() -> Vec<String> {
    JIRA_SCOPES.iter().map(|s| s.to_string()).collect()
}

fn default_jira_audience() -> Option<String> {
    Some(JIRA_AUDIENCE.to_string())
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            auth_url: default_jira_auth_url(),
            token_url: default_jira_token_url(),
            resources_url: default_jira_resources_url(),
            api_base_url: default_jira_api_base_url(),
            scopes: default_jira_scopes(),
            audience: default_jira_audience(),
        }
    }
}

impl JiraConfig {
    /// Full provider configuration with client credentials and callback URL.
    pub fn provider(
        &self,
        client: ClientCredentials,
        callback_base_url: &str,
    ) -> ProviderConfig {
        let mut provider = ProviderConfig::jira(
            client.client_id,
            client.client_secret,
            callback_url(callback_base_url, "jira"),
        );
        provider.auth_url = self.auth_url.clone();
        provider.token_url = self.token_url.clone();
        provider.resources_url = self.resources_url.clone();
        provider.api_base_url = self.api_base_url.clone();
        provider.scopes = self.scopes.clone();
        provider.audience = self.audience.clone();
        provider
    }
}

/// OAuth client credentials for one provider.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    /// Reads `ISSUE_SYNC_OAUTH_{PROVIDER}_CLIENT_ID` and `_CLIENT_SECRET`.
    ///
    /// Returns `None` unless both are set and non-empty.
    pub fn from_env(provider: &str) -> Option<Self> {
        let prefix = format!("ISSUE_SYNC_OAUTH_{}", provider.to_uppercase());
        let client_id = std::env::var(format!("{}_CLIENT_ID", prefix)).ok()?;
        let client_secret = std::env::var(format!("{}_CLIENT_SECRET", prefix)).ok()?;
        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }
        Some(Self {
            client_id,
            client_secret,
        })
    }
}

/// `{base}/api/connectors/{provider}/oauth/callback`
pub fn callback_url(callback_base_url: &str, provider: &str) -> String {
    format!(
        "{}/api/connectors/{}/oauth/callback",
        callback_base_url.trim_end_matches('/'),
        provider
    )
}

impl IssueSyncConfig {
    /// Built-in status vocabulary extended with `[status_map]`.
    pub fn status_map(&self) -> StatusMap {
        StatusMap::with_overrides(self.status_map.iter().map(|(k, v)| (k, *v)))
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<IssueSyncConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: IssueSyncConfig =
        toml::from_str(&contents).with_context(|| format!("Invalid config file {}", path))?;
    Ok(config)
}

/// Loads the file named by `ISSUE_SYNC_CONFIG`, or defaults when unset.
pub fn load_from_env() -> Result<IssueSyncConfig> {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => load_config(&path),
        Err(_) => Ok(IssueSyncConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = IssueSyncConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.server.user_id, "default");
        assert_eq!(config.storage.database_path, "issue-sync.db");
        assert_eq!(config.oauth.session_ttl_seconds, 600);
        assert_eq!(config.oauth.refresh_margin_seconds, 90);
        assert_eq!(config.oauth.default_expires_in_seconds, 3600);
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.sync.max_rate_limit_retries, 3);
        assert_eq!(config.jira.token_url, JIRA_TOKEN_URL);
        assert!(config.status_map.is_empty());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: IssueSyncConfig = toml::from_str("").unwrap();
        assert_eq!(config.sync.jql, crate::connectors::jira::DEFAULT_JQL);
        assert_eq!(config.jira.audience.as_deref(), Some(JIRA_AUDIENCE));
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:8080"
            callback_base_url = "https://sync.example.com/"
            frontend_url = "https://app.example.com"

            [storage]
            database_path = "/var/lib/issue-sync/data.db"

            [oauth]
            refresh_margin_seconds = 120

            [sync]
            page_size = 100
            max_backoff_ms = 30000
            jql = "project = OPS"

            [status_map]
            "In QA" = "IN_PROGRESS"
            "Won't Do" = "DONE"

            [jira]
            api_base_url = "http://localhost:9999"
        "#;

        let config: IssueSyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.server.user_id, "default");
        assert_eq!(config.storage.database_path, "/var/lib/issue-sync/data.db");
        assert_eq!(config.oauth.refresh_margin_seconds, 120);
        assert_eq!(config.oauth.session_ttl_seconds, 600);

        let pager = config.sync.pager_config();
        assert_eq!(pager.page_size, 100);
        assert_eq!(pager.retry.max_delay.as_millis(), 30000);
        assert_eq!(pager.retry.max_retries, 3);

        let statuses = config.status_map();
        assert_eq!(statuses.state_for(Some("in qa")), IssueState::InProgress);
        assert_eq!(statuses.state_for(Some("Won't Do")), IssueState::Done);
        assert_eq!(statuses.state_for(Some("To Do")), IssueState::Open);

        let provider = config.jira.provider(
            ClientCredentials {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
            },
            &config.server.callback_base_url,
        );
        assert_eq!(
            provider.redirect_uri,
            "https://sync.example.com/api/connectors/jira/oauth/callback"
        );
        assert_eq!(provider.api_base_url, "http://localhost:9999");
        assert_eq!(provider.token_url, JIRA_TOKEN_URL);
    }

    #[test]
    fn test_invalid_status_is_rejected() {
        let result: std::result::Result<IssueSyncConfig, _> =
            toml::from_str("[status_map]\n\"QA\" = \"TESTING\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nuser_id = \"alice\"").unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.user_id, "alice");

        assert!(load_config("/nonexistent/issue-sync.toml").is_err());
    }
}
