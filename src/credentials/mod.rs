//! Encrypted integration records for connected issue trackers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       OAuth flow / TokenManager          │
//! │  - encrypt on write, decrypt on use      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (ciphertext)         (ciphertext)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - upsert keyed on (user, provider, site)│
//! │  - never sees plaintext tokens           │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use issue_sync::credentials::{CredentialStore, IntegrationRecord, SecretCodec};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let codec = SecretCodec::from_env("ISSUE_SYNC_ENCRYPTION_KEY")?;
//! let store = CredentialStore::new("issue-sync.db")?;
//!
//! let record = IntegrationRecord {
//!     user_id: "default".to_string(),
//!     provider: "jira".to_string(),
//!     cloud_id: "11223344-aabb".to_string(),
//!     site_name: "acme".to_string(),
//!     site_url: "https://acme.atlassian.net".to_string(),
//!     scopes: ["read:jira-work".to_string()].into_iter().collect(),
//!     access_token_enc: codec.encrypt("access-token")?,
//!     refresh_token_enc: Some(codec.encrypt("refresh-token")?),
//!     expires_at: Utc::now() + Duration::hours(1),
//!     last_sync_at: None,
//!     reauth_required: false,
//! };
//! store.upsert(&record)?;
//!
//! if let Some(found) = store.get("default", "jira")? {
//!     let token = codec.decrypt(&found.access_token_enc)?;
//!     assert_eq!(token, "access-token");
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

mod encryption;
mod storage;

pub use encryption::SecretCodec;
pub use storage::CredentialStore;

/// One connected site for one user and provider.
///
/// Tokens are held as codec ciphertext only; plaintext is produced on demand
/// by the token manager and never written back here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRecord {
    pub user_id: String,
    pub provider: String,
    /// Remote site identifier (Atlassian cloud id)
    pub cloud_id: String,
    pub site_name: String,
    pub site_url: String,

    /// Granted OAuth scopes
    pub scopes: BTreeSet<String>,

    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,

    /// The access token is invalid at and after this instant
    pub expires_at: DateTime<Utc>,

    /// Completion time of the last successful sync
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Set when a refresh was rejected; cleared by the next successful upsert
    pub reauth_required: bool,
}

impl IntegrationRecord {
    /// True if the access token is expired or expires within `margin`.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin >= self.expires_at
    }
}
