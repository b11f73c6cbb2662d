//! PKCE sessions for a single authorization attempt.
//!
//! A [`PkceSession`] is created by the flow's start step and handed back to
//! the callback step. Between the two HTTP requests it is parked in a
//! [`PkceSessionStore`], keyed by a random id that travels in a cookie.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Verifier entropy in bytes; encodes to a 43-character verifier.
const VERIFIER_BYTES: usize = 32;

/// Anti-CSRF state plus PKCE verifier for one redirect round trip.
#[derive(Clone)]
pub struct PkceSession {
    /// Provider whose authorization URL was issued with this session
    pub provider: String,
    pub state: String,
    pub code_verifier: String,
    pub code_challenge: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for PkceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceSession")
            .field("provider", &self.provider)
            .field("state", &self.state)
            .field("code_verifier", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl PkceSession {
    /// Fresh verifier, derived S256 challenge and random state.
    pub fn generate(provider: &str) -> Self {
        let mut bytes = [0u8; VERIFIER_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let code_verifier = URL_SAFE_NO_PAD.encode(bytes);

        Self {
            provider: provider.to_string(),
            state: Uuid::new_v4().to_string(),
            code_challenge: code_challenge(&code_verifier),
            code_verifier,
            created_at: Utc::now(),
        }
    }

    /// Constant-time comparison against the state echoed by the provider.
    pub fn state_matches(&self, returned: &str) -> bool {
        bool::from(self.state.as_bytes().ct_eq(returned.as_bytes()))
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Short-lived server-side parking for PKCE sessions.
///
/// Sessions are single-use: [`take`](Self::take) removes them.
#[derive(Clone)]
pub struct PkceSessionStore {
    sessions: Arc<DashMap<String, PkceSession>>,
    ttl: Duration,
}

impl PkceSessionStore {
    /// # Arguments
    /// * `ttl_seconds` - How long a session stays valid (default: 600 = 10 minutes)
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Parks a session and returns the opaque id to hand to the client.
    pub fn insert(&self, session: PkceSession) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.insert(id.clone(), session);
        id
    }

    /// Removes and returns the session if it exists and has not expired.
    pub fn take(&self, id: &str) -> Option<PkceSession> {
        let (_, session) = self.sessions.remove(id)?;
        if Utc::now() - session.created_at > self.ttl {
            return None;
        }
        Some(session)
    }

    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        self.sessions
            .retain(|_, session| now - session.created_at <= self.ttl);
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

/// Background task to periodically clean up expired sessions.
///
/// Intervals below one second are raised to one second.
pub async fn run_session_cleanup(store: PkceSessionStore, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        store.cleanup_expired();
        tracing::debug!(remaining = store.count(), "PKCE session cleanup complete");
    }
}
