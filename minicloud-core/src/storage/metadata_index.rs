use crate::error::{MiniCloudError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One row of the metadata index. Existence of an entry is what makes an
/// object exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub size: u64,
    pub integrity_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Insert or replace size and tag for `key`. `created_at` survives updates.
    async fn upsert(&self, key: &str, size: u64, integrity_tag: Option<&str>) -> Result<()>;

    async fn lookup(&self, key: &str) -> Result<IndexEntry>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<IndexEntry>>;
}

/// SQLite backed index. Each call opens its own connection on a blocking
/// thread, so calls for different keys only contend inside SQLite.
pub struct SqliteMetadataIndex {
    db_path: PathBuf,
}

impl SqliteMetadataIndex {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let index = Self { db_path };
        index.init_schema()?;
        Ok(index)
    }

    /// Drop every entry. Used at startup when the content store does not
    /// outlive the process, so stale entries cannot name vanished blobs.
    pub fn clear(&self) -> Result<usize> {
        let conn = open_connection(&self.db_path)?;
        let removed = conn.execute("DELETE FROM objects", [])?;
        if removed > 0 {
            tracing::info!("Cleared {} entries from metadata index {:?}", removed, self.db_path);
        }
        Ok(removed)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = open_connection(&self.db_path)?;

        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("Opened metadata index {:?} (journal_mode={})", self.db_path, journal_mode);

        conn.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                size INTEGER NOT NULL,
                integrity_tag TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            f(&conn)
        })
        .await
        .map_err(|error| MiniCloudError::Internal(format!("metadata task failed: {}", error)))?
    }
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<IndexEntry> {
    let key: String = row.get(0)?;
    let size: i64 = row.get(1)?;
    let integrity_tag: Option<String> = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    Ok(IndexEntry {
        key,
        size: size as u64,
        integrity_tag,
        created_at: parse_timestamp(3, &created_at)?,
        updated_at: parse_timestamp(4, &updated_at)?,
    })
}

#[async_trait]
impl MetadataIndex for SqliteMetadataIndex {
    async fn upsert(&self, key: &str, size: u64, integrity_tag: Option<&str>) -> Result<()> {
        let key = key.to_string();
        let integrity_tag = integrity_tag.map(str::to_string);
        let now = Utc::now().to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO objects (key, size, integrity_tag, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    size = excluded.size,
                    integrity_tag = excluded.integrity_tag,
                    updated_at = excluded.updated_at",
                params![key, size as i64, integrity_tag, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn lookup(&self, key: &str) -> Result<IndexEntry> {
        let key = key.to_string();

        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT key, size, integrity_tag, created_at, updated_at
                 FROM objects WHERE key = ?1",
                [&key],
                entry_from_row,
            )
            .optional()?
            .ok_or(MiniCloudError::NotFound(key))
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();

        self.with_conn(move |conn| {
            let affected = conn.execute("DELETE FROM objects WHERE key = ?1", [&key])?;
            if affected == 0 {
                return Err(MiniCloudError::NotFound(key));
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<IndexEntry>> {
        let prefix = prefix.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, size, integrity_tag, created_at, updated_at
                 FROM objects
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key
                 LIMIT ?2",
            )?;

            let rows = stmt.query_map(params![prefix, limit as i64], entry_from_row)?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
        .await
    }
}
