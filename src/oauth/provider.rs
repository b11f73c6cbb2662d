//! OAuth provider configuration.
//!
//! Endpoints, scopes and client credentials for one remote tracker.

use std::fmt;

pub const JIRA_AUTH_URL: &str = "https://auth.atlassian.com/authorize";
pub const JIRA_TOKEN_URL: &str = "https://auth.atlassian.com/oauth/token";
pub const JIRA_RESOURCES_URL: &str = "https://api.atlassian.com/oauth/token/accessible-resources";
pub const JIRA_API_BASE_URL: &str = "https://api.atlassian.com";
pub const JIRA_AUDIENCE: &str = "api.atlassian.com";
pub const JIRA_SCOPES: &[&str] = &["read:jira-work", "read:jira-user", "offline_access"];

/// OAuth provider configuration
#[derive(Clone)]
pub struct ProviderConfig {
    /// Provider name used in routes, storage keys and logs (e.g. "jira")
    pub name: String,

    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token endpoint URL (code exchange and refresh)
    pub token_url: String,

    /// Endpoint listing the sites the token can access
    pub resources_url: String,

    /// Base URL of the tracker REST API
    pub api_base_url: String,

    /// Requested OAuth scopes
    pub scopes: Vec<String>,

    /// `audience` authorization parameter, when the provider wants one
    pub audience: Option<String>,

    pub client_id: String,
    pub client_secret: String,

    /// Callback URL registered with the provider
    pub redirect_uri: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("resources_url", &self.resources_url)
            .field("api_base_url", &self.api_base_url)
            .field("scopes", &self.scopes)
            .field("audience", &self.audience)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl ProviderConfig {
    /// Atlassian (Jira Cloud) endpoints with the given client credentials.
    pub fn jira(client_id: String, client_secret: String, redirect_uri: String) -> Self {
        Self {
            name: "jira".to_string(),
            auth_url: JIRA_AUTH_URL.to_string(),
            token_url: JIRA_TOKEN_URL.to_string(),
            resources_url: JIRA_RESOURCES_URL.to_string(),
            api_base_url: JIRA_API_BASE_URL.to_string(),
            scopes: JIRA_SCOPES.iter().map(|s| s.to_string()).collect(),
            audience: Some(JIRA_AUDIENCE.to_string()),
            client_id,
            client_secret,
            redirect_uri,
        }
    }

    /// Build authorization URL with state and PKCE challenge
    pub fn build_auth_url(&self, state: &str, code_challenge: &str) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code&prompt=consent&code_challenge={}&code_challenge_method=S256",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        );
        if let Some(audience) = &self.audience {
            url.push_str("&audience=");
            url.push_str(&urlencoding::encode(audience));
        }
        url
    }
}
