//! Access-token freshness for stored integrations.
//!
//! Refreshes are single-flight per `(user, provider)`: callers that find the
//! token stale queue on a per-key async mutex and re-read the record once
//! they hold it, so a refresh done by the first caller is reused by the rest.

use super::exchange::TokenEndpoint;
use crate::credentials::{CredentialStore, IntegrationRecord, SecretCodec};
use crate::error::{Error, Result};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Decrypted access token together with the record it came from.
#[derive(Clone)]
pub struct FreshCredential {
    pub record: IntegrationRecord,
    pub access_token: String,
}

impl std::fmt::Debug for FreshCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshCredential")
            .field("provider", &self.record.provider)
            .field("cloud_id", &self.record.cloud_id)
            .field("expires_at", &self.record.expires_at)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

pub struct TokenManager {
    store: Arc<CredentialStore>,
    codec: SecretCodec,
    endpoints: HashMap<String, TokenEndpoint>,
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
    margin: Duration,
    default_expires_in: i64,
}

impl TokenManager {
    /// # Arguments
    /// * `margin_seconds` - Refresh tokens expiring within this window (default: 90)
    /// * `default_expires_in` - Lifetime assumed when the provider omits `expires_in` (default: 3600)
    pub fn new(
        store: Arc<CredentialStore>,
        codec: SecretCodec,
        endpoints: impl IntoIterator<Item = TokenEndpoint>,
        margin_seconds: i64,
        default_expires_in: i64,
    ) -> Self {
        Self {
            store,
            codec,
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.provider().name.clone(), e))
                .collect(),
            locks: DashMap::new(),
            margin: Duration::seconds(margin_seconds),
            default_expires_in,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Returns a usable access token, refreshing it first if it is expired
    /// or about to expire.
    pub async fn ensure_fresh(&self, user_id: &str, provider: &str) -> Result<FreshCredential> {
        let record = self.load(user_id, provider)?;
        if !record.expires_within(Utc::now(), self.margin) {
            return self.decrypt(record);
        }

        let lock = self.lock_for(user_id, provider);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        let record = self.load(user_id, provider)?;
        if !record.expires_within(Utc::now(), self.margin) {
            tracing::debug!(provider, user_id, "Token already refreshed by concurrent caller");
            return self.decrypt(record);
        }

        self.refresh(record).await
    }

    /// Called after the remote API answered 401 to `rejected_token`.
    ///
    /// Refreshes only if the stored token is still the rejected one; otherwise
    /// the newer stored token is returned as is.
    pub async fn refresh_rejected(
        &self,
        user_id: &str,
        provider: &str,
        rejected_token: &str,
    ) -> Result<FreshCredential> {
        let lock = self.lock_for(user_id, provider);
        let _guard = lock.lock().await;

        let record = self.load(user_id, provider)?;
        let current = self.decrypt(record)?;
        if current.access_token != rejected_token {
            tracing::debug!(provider, user_id, "Rejected token already replaced");
            return Ok(current);
        }

        self.refresh(current.record).await
    }

    fn lock_for(&self, user_id: &str, provider: &str) -> Arc<Mutex<()>> {
        let key = (user_id.to_string(), provider.to_string());
        Arc::clone(&*self.locks.entry(key).or_default())
    }

    fn load(&self, user_id: &str, provider: &str) -> Result<IntegrationRecord> {
        let record = self
            .store
            .get(user_id, provider)?
            .ok_or_else(|| Error::NotConnected {
                user_id: user_id.to_string(),
                provider: provider.to_string(),
            })?;

        if record.reauth_required {
            return Err(Error::ReauthRequired {
                provider: provider.to_string(),
                reason: "integration was flagged after a rejected refresh".to_string(),
            });
        }
        Ok(record)
    }

    fn decrypt(&self, record: IntegrationRecord) -> Result<FreshCredential> {
        let access_token = self.codec.decrypt(&record.access_token_enc)?;
        Ok(FreshCredential {
            record,
            access_token,
        })
    }

    /// Must be called with the per-key lock held.
    async fn refresh(&self, mut record: IntegrationRecord) -> Result<FreshCredential> {
        let endpoint = self
            .endpoints
            .get(&record.provider)
            .ok_or_else(|| Error::NotConnected {
                user_id: record.user_id.clone(),
                provider: record.provider.clone(),
            })?;

        let Some(refresh_enc) = record.refresh_token_enc.clone() else {
            self.flag_reauth(&record)?;
            return Err(Error::ReauthRequired {
                provider: record.provider.clone(),
                reason: "no refresh token stored".to_string(),
            });
        };
        let refresh_token = self.codec.decrypt(&refresh_enc)?;

        tracing::info!(
            provider = %record.provider,
            cloud_id = %record.cloud_id,
            expires_at = %record.expires_at,
            "Refreshing access token"
        );

        let grant = match endpoint.refresh(&refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                if e.requires_reauth() {
                    self.flag_reauth(&record)?;
                }
                tracing::warn!(provider = %record.provider, error = %e, "Token refresh failed");
                return Err(e);
            }
        };

        let access_enc = self.codec.encrypt(&grant.access_token)?;
        // Providers that rotate refresh tokens invalidate the old one.
        let refresh_enc = match grant.refresh_token.as_deref() {
            Some(rotated) => self.codec.encrypt(rotated)?,
            None => refresh_enc,
        };
        let expires_at = grant.expires_at(self.default_expires_in);

        self.store.update_tokens(
            &record.user_id,
            &record.provider,
            &record.cloud_id,
            &access_enc,
            Some(&refresh_enc),
            expires_at,
        )?;

        record.access_token_enc = access_enc;
        record.refresh_token_enc = Some(refresh_enc);
        record.expires_at = expires_at;

        tracing::info!(provider = %record.provider, expires_at = %expires_at, "Access token refreshed");

        Ok(FreshCredential {
            record,
            access_token: grant.access_token,
        })
    }

    fn flag_reauth(&self, record: &IntegrationRecord) -> Result<()> {
        self.store
            .mark_reauth_required(&record.user_id, &record.provider, &record.cloud_id)?;
        tracing::warn!(
            provider = %record.provider,
            cloud_id = %record.cloud_id,
            "Integration requires reauthorization"
        );
        Ok(())
    }
}
