//! Issue cache persistence using SQLite.
//!
//! Each upsert replaces the whole row for `(provider, cloud_id, issue_key)`.
//! Rows are never deleted by sync.

use super::{IssueRecord, IssueState};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Persists normalized issues in SQLite.
pub struct IssueStore {
    conn: Mutex<Connection>,
}

impl IssueStore {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open issue cache database")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS issues (
                provider   TEXT NOT NULL,
                cloud_id   TEXT NOT NULL,
                issue_key  TEXT NOT NULL,
                title      TEXT NOT NULL,
                state      TEXT NOT NULL,
                priority   TEXT,
                issue_type TEXT,
                assignee   TEXT,
                labels     TEXT NOT NULL,
                created_at TEXT,
                updated_at TEXT,
                updated_utc TEXT,
                PRIMARY KEY (provider, cloud_id, issue_key)
            );
            "#,
        )
        .context("Failed to create issues table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("issue cache connection lock poisoned"))
    }

    /// Inserts the issue or replaces every non-key column of the cached copy.
    pub fn upsert(&self, provider: &str, cloud_id: &str, issue: &IssueRecord) -> Result<()> {
        let labels = serde_json::to_string(&issue.labels).context("Failed to encode labels")?;

        self.lock()?
            .execute(
                r#"
                INSERT INTO issues (
                    provider, cloud_id, issue_key, title, state, priority,
                    issue_type, assignee, labels, created_at, updated_at, updated_utc
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(provider, cloud_id, issue_key) DO UPDATE SET
                    title = excluded.title,
                    state = excluded.state,
                    priority = excluded.priority,
                    issue_type = excluded.issue_type,
                    assignee = excluded.assignee,
                    labels = excluded.labels,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    updated_utc = excluded.updated_utc
                "#,
                params![
                    provider,
                    cloud_id,
                    issue.issue_key,
                    issue.title,
                    issue.state.as_str(),
                    issue.priority,
                    issue.issue_type,
                    issue.assignee,
                    labels,
                    issue.created_at,
                    issue.updated_at,
                    issue.updated_at.as_deref().map(sort_key),
                ],
            )
            .with_context(|| format!("Failed to upsert issue {}", issue.issue_key))?;

        Ok(())
    }

    /// Returns every cached issue for a site, most recently updated first.
    ///
    /// Issues without an update timestamp come last; ties break on key.
    pub fn list(&self, provider: &str, cloud_id: &str) -> Result<Vec<IssueRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT issue_key, title, state, priority, issue_type, assignee,
                       labels, created_at, updated_at
                FROM issues
                WHERE provider = ?1 AND cloud_id = ?2
                ORDER BY updated_utc IS NULL, updated_utc DESC, issue_key ASC
                "#,
            )
            .context("Failed to prepare issue list query")?;

        let rows = stmt
            .query_map(params![provider, cloud_id], |row| {
                let state: String = row.get(2)?;
                let labels: String = row.get(6)?;
                Ok((
                    IssueRecord {
                        issue_key: row.get(0)?,
                        title: row.get(1)?,
                        state: IssueState::parse(&state),
                        priority: row.get(3)?,
                        issue_type: row.get(4)?,
                        assignee: row.get(5)?,
                        labels: BTreeSet::new(),
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    },
                    labels,
                ))
            })
            .context("Failed to query issues")?;

        let mut issues = Vec::new();
        for row in rows {
            let (mut issue, labels) = row.context("Failed to read issue row")?;
            issue.labels = serde_json::from_str(&labels)
                .with_context(|| format!("Corrupt labels for issue {}", issue.issue_key))?;
            issues.push(issue);
        }
        Ok(issues)
    }

    /// Number of cached issues for a site.
    pub fn count(&self, provider: &str, cloud_id: &str) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM issues WHERE provider = ?1 AND cloud_id = ?2",
                params![provider, cloud_id],
                |row| row.get(0),
            )
            .context("Failed to count issues")?;
        Ok(count as usize)
    }
}

/// Fixed-width UTC form of a remote timestamp so that rows order correctly
/// across offsets. Unparseable values are kept verbatim.
fn sort_key(timestamp: &str) -> String {
    DateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(timestamp))
        .map(|t| {
            t.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        })
        .unwrap_or_else(|_| timestamp.to_string())
}
