//! HTTP surface for connecting trackers, triggering syncs and reading issues.
//!
//! All routes live under `/api/connectors/:provider/`. A provider without
//! OAuth client credentials configured is unknown and answers 404.

pub mod connectors;
pub mod oauth;

use crate::credentials::CredentialStore;
use crate::error::Error;
use crate::issues::IssueReadModel;
use crate::oauth::{OAuthFlow, PkceSessionStore};
use crate::sync::SyncEngine;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Single-tenant user every integration belongs to
    pub user_id: String,
    /// Browser destination after a successful connection
    pub frontend_url: String,
    pub credentials: Arc<CredentialStore>,
    /// OAuth flows by provider name; also the set of known providers
    pub flows: Arc<HashMap<String, OAuthFlow>>,
    pub sessions: PkceSessionStore,
    pub session_ttl_seconds: i64,
    pub sync: Arc<SyncEngine>,
    pub read_model: IssueReadModel,
}

impl AppState {
    fn flow(&self, provider: &str) -> Result<&OAuthFlow, AppError> {
        self.flows
            .get(provider)
            .ok_or_else(|| AppError::UnknownProvider(provider.to_string()))
    }
}

/// Create the connector API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/connectors/:provider/oauth/start", get(oauth::start))
        .route("/api/connectors/:provider/oauth/callback", get(oauth::callback))
        .route("/api/connectors/:provider/status", get(connectors::status))
        .route("/api/connectors/:provider/sync", post(connectors::sync))
        .route("/api/connectors/:provider/issues", get(connectors::issues))
        .with_state(Arc::new(state))
}

/// Error response
#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reauth_required: bool,
}

/// Application error types for connector endpoints
#[derive(Debug)]
pub enum AppError {
    UnknownProvider(String),
    Domain(Error),
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        AppError::Domain(e)
    }
}

/// HTTP status for a domain error.
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Auth(_) | Error::NoAccessibleResource => StatusCode::BAD_REQUEST,
        Error::ReauthRequired { .. } | Error::AuthExhausted { .. } => StatusCode::UNAUTHORIZED,
        Error::NotConnected { .. } => StatusCode::NOT_FOUND,
        Error::SyncInProgress { .. } => StatusCode::CONFLICT,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::Remote { .. } => StatusCode::BAD_GATEWAY,
        Error::Codec(_) | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client-facing message. Internal failures are logged, not echoed.
pub fn public_message(error: &Error) -> String {
    match error {
        Error::Codec(_) | Error::Storage(_) => {
            error!(error = %error, "Internal error");
            "Internal server error".to_string()
        }
        other => other.to_string(),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::UnknownProvider(name) => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    ok: false,
                    error: format!("Provider '{}' not found", name),
                    reauth_required: false,
                },
            ),
            AppError::Domain(e) => (
                status_for(&e),
                ErrorResponse {
                    ok: false,
                    error: public_message(&e),
                    reauth_required: e.requires_reauth(),
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}
