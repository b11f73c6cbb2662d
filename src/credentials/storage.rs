//! Integration record storage using SQLite.
//!
//! A thin durable map keyed by `(user_id, provider, cloud_id)`. Every write is
//! a single statement, so concurrent writers resolve as whole-record
//! last-writer-wins and never interleave fields.

use super::IntegrationRecord;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Integration record storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE integrations (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     cloud_id TEXT NOT NULL,
///     site_name TEXT NOT NULL,
///     site_url TEXT NOT NULL,
///     scopes TEXT NOT NULL,             -- JSON array
///     access_token_enc TEXT NOT NULL,   -- codec ciphertext
///     refresh_token_enc TEXT,           -- codec ciphertext (optional)
///     expires_at TEXT NOT NULL,         -- RFC 3339
///     last_sync_at TEXT,                -- RFC 3339 (optional)
///     reauth_required INTEGER NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, provider, cloud_id)
/// );
/// ```
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

/// Row as read from SQLite, before timestamp and JSON parsing.
struct RawRow {
    user_id: String,
    provider: String,
    cloud_id: String,
    site_name: String,
    site_url: String,
    scopes: String,
    access_token_enc: String,
    refresh_token_enc: Option<String>,
    expires_at: String,
    last_sync_at: Option<String>,
    reauth_required: bool,
}

impl CredentialStore {
    /// Creates or opens a credential store. `":memory:"` gives a private
    /// in-memory database.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open credentials database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS integrations (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                cloud_id TEXT NOT NULL,
                site_name TEXT NOT NULL,
                site_url TEXT NOT NULL,
                scopes TEXT NOT NULL,
                access_token_enc TEXT NOT NULL,
                refresh_token_enc TEXT,
                expires_at TEXT NOT NULL,
                last_sync_at TEXT,
                reauth_required INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, provider, cloud_id)
            );
            CREATE INDEX IF NOT EXISTS idx_integrations_user_provider
                ON integrations(user_id, provider);
            "#,
        )
        .context("Failed to create integrations table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("credential store connection lock poisoned"))
    }

    /// Inserts or replaces the record for its `(user_id, provider, cloud_id)`.
    ///
    /// Identity columns are kept; site details, scopes, tokens and expiry are
    /// replaced; `reauth_required` is cleared. `last_sync_at` is left alone
    /// (it only moves through [`touch_last_sync`](Self::touch_last_sync)).
    pub fn upsert(&self, record: &IntegrationRecord) -> Result<()> {
        let scopes = serde_json::to_string(&record.scopes).context("Failed to encode scopes")?;
        let now = row_timestamp();

        self.lock()?
            .execute(
                r#"
                INSERT INTO integrations (
                    user_id, provider, cloud_id, site_name, site_url, scopes,
                    access_token_enc, refresh_token_enc, expires_at,
                    last_sync_at, reauth_required, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)
                ON CONFLICT(user_id, provider, cloud_id) DO UPDATE SET
                    site_name = excluded.site_name,
                    site_url = excluded.site_url,
                    scopes = excluded.scopes,
                    access_token_enc = excluded.access_token_enc,
                    refresh_token_enc = excluded.refresh_token_enc,
                    expires_at = excluded.expires_at,
                    reauth_required = 0,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.user_id,
                    record.provider,
                    record.cloud_id,
                    record.site_name,
                    record.site_url,
                    scopes,
                    record.access_token_enc,
                    record.refresh_token_enc,
                    record.expires_at.to_rfc3339(),
                    record.last_sync_at.map(|t| t.to_rfc3339()),
                    now,
                ],
            )
            .context("Failed to upsert integration")?;

        Ok(())
    }

    /// Returns the most recently updated site for a user and provider.
    pub fn get(&self, user_id: &str, provider: &str) -> Result<Option<IntegrationRecord>> {
        let raw = self
            .lock()?
            .query_row(
                r#"
                SELECT user_id, provider, cloud_id, site_name, site_url, scopes,
                       access_token_enc, refresh_token_enc, expires_at,
                       last_sync_at, reauth_required
                FROM integrations
                WHERE user_id = ?1 AND provider = ?2
                ORDER BY updated_at DESC, id DESC
                LIMIT 1
                "#,
                params![user_id, provider],
                |row| {
                    Ok(RawRow {
                        user_id: row.get(0)?,
                        provider: row.get(1)?,
                        cloud_id: row.get(2)?,
                        site_name: row.get(3)?,
                        site_url: row.get(4)?,
                        scopes: row.get(5)?,
                        access_token_enc: row.get(6)?,
                        refresh_token_enc: row.get(7)?,
                        expires_at: row.get(8)?,
                        last_sync_at: row.get(9)?,
                        reauth_required: row.get(10)?,
                    })
                },
            )
            .optional()
            .context("Failed to query integration")?;

        raw.map(RawRow::into_record).transpose()
    }

    /// Replaces the token columns of an existing record after a refresh.
    ///
    /// Returns false if the record does not exist.
    pub fn update_tokens(
        &self,
        user_id: &str,
        provider: &str,
        cloud_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self
            .lock()?
            .execute(
                r#"
                UPDATE integrations SET
                    access_token_enc = ?4,
                    refresh_token_enc = ?5,
                    expires_at = ?6,
                    reauth_required = 0,
                    updated_at = ?7
                WHERE user_id = ?1 AND provider = ?2 AND cloud_id = ?3
                "#,
                params![
                    user_id,
                    provider,
                    cloud_id,
                    access_token_enc,
                    refresh_token_enc,
                    expires_at.to_rfc3339(),
                    row_timestamp(),
                ],
            )
            .context("Failed to update tokens")?;

        Ok(rows > 0)
    }

    /// Records a successful sync. Touches nothing but `last_sync_at`.
    pub fn touch_last_sync(
        &self,
        user_id: &str,
        provider: &str,
        cloud_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self
            .lock()?
            .execute(
                "UPDATE integrations SET last_sync_at = ?4
                 WHERE user_id = ?1 AND provider = ?2 AND cloud_id = ?3",
                params![user_id, provider, cloud_id, timestamp.to_rfc3339()],
            )
            .context("Failed to update last_sync_at")?;

        Ok(rows > 0)
    }

    /// Flags the integration as needing a new authorization.
    pub fn mark_reauth_required(&self, user_id: &str, provider: &str, cloud_id: &str) -> Result<bool> {
        let rows = self
            .lock()?
            .execute(
                "UPDATE integrations SET reauth_required = 1
                 WHERE user_id = ?1 AND provider = ?2 AND cloud_id = ?3",
                params![user_id, provider, cloud_id],
            )
            .context("Failed to mark integration for reauthorization")?;

        Ok(rows > 0)
    }
}

impl RawRow {
    fn into_record(self) -> Result<IntegrationRecord> {
        let scopes: BTreeSet<String> =
            serde_json::from_str(&self.scopes).context("Failed to decode scopes")?;

        Ok(IntegrationRecord {
            user_id: self.user_id,
            provider: self.provider,
            cloud_id: self.cloud_id,
            site_name: self.site_name,
            site_url: self.site_url,
            scopes,
            access_token_enc: self.access_token_enc,
            refresh_token_enc: self.refresh_token_enc,
            expires_at: parse_timestamp(&self.expires_at).context("Invalid expires_at")?,
            last_sync_at: self
                .last_sync_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .context("Invalid last_sync_at")?,
            reauth_required: self.reauth_required,
        })
    }
}

/// `updated_at` values are compared as text, so they need a fixed width.
fn row_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
