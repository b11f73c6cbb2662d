//! Calls to the provider's token and accessible-resources endpoints.

use super::ProviderConfig;
use crate::error::{AuthError, Error, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Longest token lifetime accepted from a provider (about 68 years).
const MAX_EXPIRES_IN: i64 = i32::MAX as i64;

/// Token endpoint request body (code exchange and refresh share the endpoint)
#[derive(Serialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
enum TokenRequest<'a> {
    AuthorizationCode {
        client_id: &'a str,
        client_secret: &'a str,
        code: &'a str,
        redirect_uri: &'a str,
        code_verifier: &'a str,
    },
    RefreshToken {
        client_id: &'a str,
        client_secret: &'a str,
        refresh_token: &'a str,
    },
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Space-separated granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenGrant {
    pub fn scopes(&self) -> impl Iterator<Item = String> + '_ {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
    }

    /// Absolute expiry of the access token.
    ///
    /// A missing or negative `expires_in` falls back to `default_expires_in`;
    /// oversized values are clamped.
    pub fn expires_at(&self, default_expires_in: i64) -> DateTime<Utc> {
        let seconds = self
            .expires_in
            .filter(|s| *s >= 0)
            .unwrap_or(default_expires_in)
            .clamp(0, MAX_EXPIRES_IN);
        Utc::now() + Duration::seconds(seconds)
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// One site the access token can reach.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AccessibleResource {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// HTTP client for one provider's OAuth endpoints.
#[derive(Clone)]
pub struct TokenEndpoint {
    provider: Arc<ProviderConfig>,
    http_client: reqwest::Client,
}

impl TokenEndpoint {
    pub fn new(provider: Arc<ProviderConfig>) -> Self {
        Self {
            provider,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Exchanges an authorization code plus PKCE verifier for tokens.
    ///
    /// A non-2xx answer is `AuthError::TokenExchangeRejected` carrying the
    /// provider's body for diagnosis.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenGrant> {
        let request = TokenRequest::AuthorizationCode {
            client_id: &self.provider.client_id,
            client_secret: &self.provider.client_secret,
            code,
            redirect_uri: &self.provider.redirect_uri,
            code_verifier,
        };

        tracing::debug!(provider = %self.provider.name, "Exchanging authorization code for token");

        let response = self
            .http_client
            .post(&self.provider.token_url)
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::remote("token exchange", e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = read_body(response).await;
            return Err(AuthError::TokenExchangeRejected { status, body }.into());
        }

        let grant: TokenGrant = response
            .json()
            .await
            .map_err(|e| Error::remote("token exchange", e))?;

        tracing::debug!(
            provider = %self.provider.name,
            has_refresh_token = grant.refresh_token.is_some(),
            expires_in = ?grant.expires_in,
            "Token exchange successful"
        );

        Ok(grant)
    }

    /// Trades a refresh token for a new access token.
    ///
    /// A 4xx answer means the refresh token is revoked or expired and is
    /// reported as `ReauthRequired`, except 408 and 429 which are transient.
    /// Transient failures and 5xx are reported as `Remote`.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let request = TokenRequest::RefreshToken {
            client_id: &self.provider.client_id,
            client_secret: &self.provider.client_secret,
            refresh_token,
        };

        let response = self
            .http_client
            .post(&self.provider.token_url)
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::remote("token refresh", e))?;

        let status = response.status();
        if status.is_client_error() && !is_transient(status) {
            let body = read_body(response).await;
            return Err(Error::ReauthRequired {
                provider: self.provider.name.clone(),
                reason: format!("refresh rejected with status {}: {}", status.as_u16(), body),
            });
        }
        if !status.is_success() {
            return Err(Error::Remote {
                stage: "token refresh",
                status: Some(status.as_u16()),
                body: read_body(response).await,
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::remote("token refresh", e))
    }

    /// Lists the sites reachable with `access_token`.
    pub async fn accessible_resources(&self, access_token: &str) -> Result<Vec<AccessibleResource>> {
        let response = self
            .http_client
            .get(&self.provider.resources_url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::remote("resource discovery", e))?;

        if response.status() != StatusCode::OK {
            let status = response.status().as_u16();
            return Err(Error::Remote {
                stage: "resource discovery",
                status: Some(status),
                body: read_body(response).await,
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::remote("resource discovery", e))
    }
}

fn is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
    )
}

async fn read_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string())
}
