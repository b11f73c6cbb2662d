//! Error taxonomy for the integration and sync engine.
//!
//! Internal plumbing (SQLite, parsing) uses `anyhow` with context and is
//! folded into [`Error::Storage`] at the domain boundary. Nothing in here
//! ever carries token plaintext, ciphertext, PKCE verifiers or client secrets.

use thiserror::Error;

/// Failures of the Secret Codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encryption key is missing or not 32 bytes of base64")]
    InvalidKey,

    #[error("ciphertext is malformed")]
    Malformed,

    #[error("ciphertext failed authentication (wrong key or tampered)")]
    Tampered,
}

/// Failures during the authorization round trip.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("provider denied authorization: {error} ({description})")]
    ProviderDenied { error: String, description: String },

    #[error("callback is missing the authorization code")]
    MissingCode,

    #[error("PKCE session is missing (expired or replayed)")]
    MissingSession,

    #[error("OAuth state mismatch (possible CSRF)")]
    StateMismatch,

    #[error("token exchange rejected with status {status}: {body}")]
    TokenExchangeRejected { status: u16, body: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{provider} integration must be reconnected: {reason}")]
    ReauthRequired { provider: String, reason: String },

    #[error("no accessible resources were returned for this account")]
    NoAccessibleResource,

    #[error("rate limited by remote tracker after retries ({fetched} issues fetched)")]
    RateLimited { fetched: usize },

    #[error("remote tracker rejected the refreshed token ({fetched} issues fetched)")]
    AuthExhausted { fetched: usize },

    #[error("{provider} is not connected for user {user_id}")]
    NotConnected { user_id: String, provider: String },

    #[error("a sync is already running for {provider} / {user_id}")]
    SyncInProgress { user_id: String, provider: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{stage} failed with status {status:?}: {body}")]
    Remote {
        stage: &'static str,
        status: Option<u16>,
        body: String,
    },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl Error {
    /// Whether the user has to go through the OAuth flow again.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::ReauthRequired { .. } | Self::AuthExhausted { .. })
    }

    pub(crate) fn remote(stage: &'static str, err: reqwest::Error) -> Self {
        Self::Remote {
            stage,
            status: err.status().map(|s| s.as_u16()),
            body: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
