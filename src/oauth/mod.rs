//! OAuth 2.0 authorization for issue tracker connections.
//!
//! Implements the PKCE authorization code flow:
//! 1. GET /api/connectors/:provider/oauth/start → [`OAuthFlow::start`], redirect to provider
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to /api/connectors/:provider/oauth/callback
//! 4. [`OAuthFlow::complete`]: validate, exchange code, discover site, persist encrypted tokens
//!
//! Afterwards [`TokenManager`] keeps the stored access token fresh.

mod exchange;
mod pkce;
pub mod provider;
mod refresh;

pub use exchange::{AccessibleResource, TokenEndpoint, TokenGrant};
pub use pkce::{code_challenge, run_session_cleanup, PkceSession, PkceSessionStore};
pub use provider::ProviderConfig;
pub use refresh::{FreshCredential, TokenManager};

use crate::credentials::{CredentialStore, IntegrationRecord, SecretCodec};
use crate::error::{AuthError, Error, Result};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Progress of one authorization attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowStage {
    Start,
    Redirected,
    CallbackReceived,
    TokenExchanged,
    ResourcesDiscovered,
    Persisted,
    Failed,
}

impl fmt::Display for FlowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowStage::Start => "start",
            FlowStage::Redirected => "redirected",
            FlowStage::CallbackReceived => "callback_received",
            FlowStage::TokenExchanged => "token_exchanged",
            FlowStage::ResourcesDiscovered => "resources_discovered",
            FlowStage::Persisted => "persisted",
            FlowStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// OAuth callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Output of [`OAuthFlow::start`]: the session to park and the URL to redirect to.
#[derive(Debug)]
pub struct AuthorizationRequest {
    pub session: PkceSession,
    pub url: String,
}

/// Drives the authorization round trip for one provider.
#[derive(Clone)]
pub struct OAuthFlow {
    endpoint: TokenEndpoint,
    store: Arc<CredentialStore>,
    codec: SecretCodec,
    default_expires_in: i64,
}

impl OAuthFlow {
    pub fn new(
        endpoint: TokenEndpoint,
        store: Arc<CredentialStore>,
        codec: SecretCodec,
        default_expires_in: i64,
    ) -> Self {
        Self {
            endpoint,
            store,
            codec,
            default_expires_in,
        }
    }

    pub fn provider(&self) -> &ProviderConfig {
        self.endpoint.provider()
    }

    /// START → REDIRECTED: fresh PKCE session plus the authorization URL.
    pub fn start(&self) -> AuthorizationRequest {
        let session = PkceSession::generate(&self.provider().name);
        let url = self
            .provider()
            .build_auth_url(&session.state, &session.code_challenge);

        info!(provider = %self.provider().name, stage = %FlowStage::Redirected, "Starting OAuth flow");

        AuthorizationRequest { session, url }
    }

    /// CALLBACK_RECEIVED → ... → PERSISTED.
    ///
    /// `session` is the PKCE session taken from the session store, `None`
    /// when it expired or was already consumed. Nothing is written unless
    /// every step succeeds.
    pub async fn complete(
        &self,
        user_id: &str,
        session: Option<PkceSession>,
        params: &CallbackParams,
    ) -> Result<IntegrationRecord> {
        let mut stage = FlowStage::CallbackReceived;
        let result = self.run_callback(user_id, session, params, &mut stage).await;

        match &result {
            Ok(record) => info!(
                provider = %record.provider,
                cloud_id = %record.cloud_id,
                site = %record.site_name,
                stage = %FlowStage::Persisted,
                "OAuth flow completed"
            ),
            Err(e) => warn!(
                provider = %self.provider().name,
                last_stage = %stage,
                stage = %FlowStage::Failed,
                error = %e,
                "OAuth flow failed"
            ),
        }

        result
    }

    async fn run_callback(
        &self,
        user_id: &str,
        session: Option<PkceSession>,
        params: &CallbackParams,
        stage: &mut FlowStage,
    ) -> Result<IntegrationRecord> {
        if let Some(error) = &params.error {
            return Err(AuthError::ProviderDenied {
                error: error.clone(),
                description: params.error_description.clone().unwrap_or_default(),
            }
            .into());
        }

        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCode)?;
        let session = session.ok_or(AuthError::MissingSession)?;
        let returned_state = params.state.as_deref().unwrap_or_default();
        if session.provider != self.provider().name || !session.state_matches(returned_state) {
            return Err(AuthError::StateMismatch.into());
        }

        let grant = self
            .endpoint
            .exchange_code(code, &session.code_verifier)
            .await?;
        *stage = FlowStage::TokenExchanged;

        let resources = self
            .endpoint
            .accessible_resources(&grant.access_token)
            .await?;
        // Multiple sites resolve to the first entry.
        let site = resources
            .into_iter()
            .next()
            .ok_or(Error::NoAccessibleResource)?;
        *stage = FlowStage::ResourcesDiscovered;

        let record = IntegrationRecord {
            user_id: user_id.to_string(),
            provider: self.provider().name.clone(),
            cloud_id: site.id,
            site_name: site.name,
            site_url: site.url,
            scopes: grant.scopes().collect(),
            access_token_enc: self.codec.encrypt(&grant.access_token)?,
            refresh_token_enc: grant
                .refresh_token
                .as_deref()
                .map(|t| self.codec.encrypt(t))
                .transpose()?,
            expires_at: grant.expires_at(self.default_expires_in),
            last_sync_at: None,
            reauth_required: false,
        };

        self.store.upsert(&record)?;
        *stage = FlowStage::Persisted;

        // Re-read so last_sync_at of a previous connection to the same site is reported.
        Ok(self
            .store
            .get(user_id, &record.provider)?
            .unwrap_or(record))
    }
}
