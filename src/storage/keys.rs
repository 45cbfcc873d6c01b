//! API key and usage store
//!
//! SQLite-backed. Keys are soft-deleted so usage history outlives them.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Key {0} not found")]
    NotFound(i64),

    #[error("Key {0} is deleted and cannot change status")]
    Deleted(i64),

    #[error("Invalid status: {0:?} (expected active, revoked or deleted)")]
    InvalidStatus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle status of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
    Deleted,
    /// Never stored; derived from `expires_at` for active keys
    Expired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Revoked => "revoked",
            KeyStatus::Deleted => "deleted",
            KeyStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = KeyStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(KeyStatus::Active),
            "revoked" => Ok(KeyStatus::Revoked),
            "deleted" => Ok(KeyStatus::Deleted),
            "expired" => Ok(KeyStatus::Expired),
            other => Err(KeyStoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// Listing filter; `All` hides deleted keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Only(KeyStatus),
}

impl StatusFilter {
    pub fn parse(value: Option<&str>) -> Result<Self, KeyStoreError> {
        match value.map(str::trim) {
            None | Some("") | Some("all") => Ok(StatusFilter::All),
            Some(s) => s.parse().map(StatusFilter::Only),
        }
    }

    fn matches(&self, status: KeyStatus) -> bool {
        match self {
            StatusFilter::All => status != KeyStatus::Deleted,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub status: KeyStatus,
    pub created_at: String,
    pub deleted_at: Option<String>,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: i64,
    pub key_id: i64,
    pub endpoint: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub key_id: i64,
    pub name: String,
    pub status: KeyStatus,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub last_used: Option<String>,
}

/// The narrow contract the HTTP gateway needs
pub trait KeyStore: Send + Sync {
    /// Id of the key if `secret` names a currently active key
    fn validate(&self, secret: &str) -> Result<Option<i64>, KeyStoreError>;

    fn record_usage(
        &self,
        key_id: i64,
        endpoint: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<(), KeyStoreError>;
}

/// Generate a key secret: `llm-` followed by 48 alphanumeric characters
pub fn generate_secret() -> String {
    let body: String = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        .chars()
        .take(48)
        .collect();
    format!("llm-{}", body)
}

pub struct SqliteKeyStore {
    conn: Mutex<Connection>,
}

const KEY_COLUMNS: &str = "id, name, key, status, created_at, deleted_at, expires_at";

impl SqliteKeyStore {
    pub fn open(path: &Path) -> Result<Self, KeyStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, KeyStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), KeyStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                key         TEXT UNIQUE NOT NULL,
                status      TEXT NOT NULL DEFAULT 'active',
                created_at  TEXT NOT NULL,
                deleted_at  TEXT,
                expires_at  TEXT
            );
            CREATE TABLE IF NOT EXISTS key_usage (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                key_id            INTEGER NOT NULL REFERENCES api_keys(id),
                endpoint          TEXT NOT NULL,
                prompt_tokens     INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens      INTEGER NOT NULL DEFAULT 0,
                created_at        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_key ON key_usage(key_id);
            "#,
        )?;
        Ok(())
    }

    fn row_to_key(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
        let stored: String = row.get(3)?;
        let expires_at: Option<String> = row.get(6)?;
        let status = effective_status(
            stored.parse().unwrap_or(KeyStatus::Revoked),
            expires_at.as_deref(),
        );
        Ok(ApiKey {
            id: row.get(0)?,
            name: row.get(1)?,
            key: row.get(2)?,
            status,
            created_at: row.get(4)?,
            deleted_at: row.get(5)?,
            expires_at,
        })
    }

    /// Create an active key and return it with its secret
    pub fn add_key(&self, name: &str, expires_in_days: Option<u32>) -> Result<ApiKey, KeyStoreError> {
        let now = Utc::now();
        let created_at = now.to_rfc3339();
        let expires_at = expires_in_days.map(|d| (now + Duration::days(d as i64)).to_rfc3339());
        let secret = generate_secret();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_keys (name, key, status, created_at, expires_at) VALUES (?1, ?2, 'active', ?3, ?4)",
            params![name, secret, created_at, expires_at],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(key_id = id, name, "Created API key");

        Ok(ApiKey {
            id,
            name: name.to_string(),
            key: secret,
            status: KeyStatus::Active,
            created_at,
            deleted_at: None,
            expires_at,
        })
    }

    pub fn get_key(&self, id: i64) -> Result<ApiKey, KeyStoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM api_keys WHERE id = ?1", KEY_COLUMNS),
            params![id],
            Self::row_to_key,
        )
        .optional()?
        .ok_or(KeyStoreError::NotFound(id))
    }

    /// Newest first, filtered on the effective status
    pub fn list_keys(&self, filter: StatusFilter) -> Result<Vec<ApiKey>, KeyStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_keys ORDER BY id DESC",
            KEY_COLUMNS
        ))?;
        let keys = stmt
            .query_map([], Self::row_to_key)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys.into_iter().filter(|k| filter.matches(k.status)).collect())
    }

    /// Move a key to active, revoked or deleted. Deleted is terminal.
    pub fn set_status(&self, id: i64, status: KeyStatus) -> Result<ApiKey, KeyStoreError> {
        if status == KeyStatus::Expired {
            return Err(KeyStoreError::InvalidStatus(status.to_string()));
        }

        let current = self.get_key(id)?;
        if current.status == KeyStatus::Deleted {
            return Err(KeyStoreError::Deleted(id));
        }

        {
            let conn = self.conn.lock();
            let deleted_at = (status == KeyStatus::Deleted).then(|| Utc::now().to_rfc3339());
            conn.execute(
                "UPDATE api_keys SET status = ?1, deleted_at = ?2 WHERE id = ?3",
                params![status.as_str(), deleted_at, id],
            )?;
        }
        tracing::info!(key_id = id, status = %status, "Changed API key status");

        self.get_key(id)
    }

    /// Number of keys that currently validate
    pub fn key_count(&self) -> Result<usize, KeyStoreError> {
        Ok(self.list_keys(StatusFilter::Only(KeyStatus::Active))?.len())
    }

    /// Per-key totals, deleted keys included
    pub fn usage_summary(&self, key_id: Option<i64>) -> Result<Vec<UsageSummary>, KeyStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT k.id, k.name, k.status, k.expires_at,
                   COUNT(u.id),
                   COALESCE(SUM(u.prompt_tokens), 0),
                   COALESCE(SUM(u.completion_tokens), 0),
                   COALESCE(SUM(u.total_tokens), 0),
                   MAX(u.created_at)
            FROM api_keys k
            LEFT JOIN key_usage u ON u.key_id = k.id
            WHERE ?1 IS NULL OR k.id = ?1
            GROUP BY k.id
            ORDER BY k.id DESC
            "#,
        )?;
        let rows = stmt
            .query_map(params![key_id], |row| {
                let stored: String = row.get(2)?;
                let expires_at: Option<String> = row.get(3)?;
                Ok(UsageSummary {
                    key_id: row.get(0)?,
                    name: row.get(1)?,
                    status: effective_status(
                        stored.parse().unwrap_or(KeyStatus::Revoked),
                        expires_at.as_deref(),
                    ),
                    requests: row.get::<_, i64>(4)? as u64,
                    prompt_tokens: row.get::<_, i64>(5)? as u64,
                    completion_tokens: row.get::<_, i64>(6)? as u64,
                    total_tokens: row.get::<_, i64>(7)? as u64,
                    last_used: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(id) = key_id {
            if rows.is_empty() {
                return Err(KeyStoreError::NotFound(id));
            }
        }
        Ok(rows)
    }

    /// Individual usage rows, newest first
    pub fn usage_history(&self, key_id: i64, limit: usize) -> Result<Vec<UsageRecord>, KeyStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, key_id, endpoint, prompt_tokens, completion_tokens, total_tokens, created_at \
             FROM key_usage WHERE key_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![key_id, limit as i64], |row| {
                Ok(UsageRecord {
                    id: row.get(0)?,
                    key_id: row.get(1)?,
                    endpoint: row.get(2)?,
                    prompt_tokens: row.get(3)?,
                    completion_tokens: row.get(4)?,
                    total_tokens: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl KeyStore for SqliteKeyStore {
    fn validate(&self, secret: &str) -> Result<Option<i64>, KeyStoreError> {
        let conn = self.conn.lock();
        let row: Option<(i64, String, Option<String>)> = conn
            .query_row(
                "SELECT id, status, expires_at FROM api_keys WHERE key = ?1",
                params![secret],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(row.and_then(|(id, status, expires_at)| {
            let status = effective_status(status.parse().ok()?, expires_at.as_deref());
            (status == KeyStatus::Active).then_some(id)
        }))
    }

    fn record_usage(
        &self,
        key_id: i64,
        endpoint: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<(), KeyStoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO key_usage (key_id, endpoint, prompt_tokens, completion_tokens, total_tokens, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key_id,
                endpoint,
                prompt_tokens,
                completion_tokens,
                prompt_tokens + completion_tokens,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

/// Active keys past their expiry report as expired
fn effective_status(stored: KeyStatus, expires_at: Option<&str>) -> KeyStatus {
    if stored != KeyStatus::Active {
        return stored;
    }
    let expired = expires_at
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .is_some_and(|t| t.with_timezone(&Utc) <= Utc::now());
    if expired {
        KeyStatus::Expired
    } else {
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_format() {
        let secret = generate_secret();
        assert!(secret.starts_with("llm-"));
        assert_eq!(secret.len(), 52);
        assert!(secret[4..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_key_lifecycle() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        let key = store.add_key("ci", None).unwrap();
        assert_eq!(store.validate(&key.key).unwrap(), Some(key.id));
        assert_eq!(store.key_count().unwrap(), 1);

        store.set_status(key.id, KeyStatus::Revoked).unwrap();
        assert_eq!(store.validate(&key.key).unwrap(), None);

        store.set_status(key.id, KeyStatus::Active).unwrap();
        assert_eq!(store.validate(&key.key).unwrap(), Some(key.id));

        let deleted = store.set_status(key.id, KeyStatus::Deleted).unwrap();
        assert!(deleted.deleted_at.is_some());
        assert_eq!(store.validate(&key.key).unwrap(), None);

        assert!(matches!(
            store.set_status(key.id, KeyStatus::Active),
            Err(KeyStoreError::Deleted(_))
        ));
    }

    #[test]
    fn test_filters_hide_deleted_from_all() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        let a = store.add_key("a", None).unwrap();
        let b = store.add_key("b", None).unwrap();
        store.set_status(b.id, KeyStatus::Deleted).unwrap();

        let all = store.list_keys(StatusFilter::All).unwrap();
        assert_eq!(all.iter().map(|k| k.id).collect::<Vec<_>>(), vec![a.id]);

        let deleted = store.list_keys(StatusFilter::Only(KeyStatus::Deleted)).unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id, b.id);

        let active = store.list_keys(StatusFilter::parse(Some("active")).unwrap()).unwrap();
        assert_eq!(active.len(), 1);
        assert!(StatusFilter::parse(Some("bogus")).is_err());
    }

    #[test]
    fn test_usage_survives_deletion() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        let key = store.add_key("metered", None).unwrap();
        store.record_usage(key.id, "/v1/completions", 3, 7).unwrap();
        store.record_usage(key.id, "/v1/chat/completions", 2, 2).unwrap();
        store.set_status(key.id, KeyStatus::Deleted).unwrap();

        let summary = store.usage_summary(Some(key.id)).unwrap();
        assert_eq!(summary[0].requests, 2);
        assert_eq!(summary[0].total_tokens, 14);
        assert_eq!(summary[0].status, KeyStatus::Deleted);

        let history = store.usage_history(key.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].endpoint, "/v1/chat/completions");
    }

    #[test]
    fn test_expired_key_fails_validation() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        let key = store.add_key("short-lived", Some(0)).unwrap();
        assert_eq!(store.validate(&key.key).unwrap(), None);

        let expired = store.list_keys(StatusFilter::Only(KeyStatus::Expired)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(store.key_count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_key() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        assert!(matches!(store.get_key(42), Err(KeyStoreError::NotFound(42))));
        assert!(matches!(store.usage_summary(Some(42)), Err(KeyStoreError::NotFound(42))));
        assert_eq!(store.validate("llm-nope").unwrap(), None);
    }
}
