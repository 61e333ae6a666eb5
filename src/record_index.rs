//! Per-repository record-mutation index.
//!
//! One row per record path: the revision that last touched it and the
//! content id of its current value, NULL once deleted. Tombstone rows are
//! kept forever so a sync resuming from an old revision still observes
//! the deletion; nothing is ever physically removed.

use crate::config::RetryConfig;
use crate::db::{execute_with_retry, open_feed_db};
use crate::types::{Cid, RecordCursor, RecordEntry};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct RecordIndex {
    conn: Mutex<Connection>,
    retry: RetryConfig,
}

impl RecordIndex {
    /// Open or create one repository's record index.
    pub fn open(path: &Path, retry: RetryConfig) -> Result<Self> {
        let conn = open_feed_db(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS record_sync (
                path TEXT PRIMARY KEY,
                rev TEXT NOT NULL,
                cid TEXT
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS record_sync_rev_idx ON record_sync (rev, path);",
        )
        .context("Failed to create record_sync table")?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Record a create or update of a record path.
    pub async fn put(&self, path: &str, rev: &str, cid: &Cid) -> Result<()> {
        execute_with_retry(&self.retry, || {
            self.conn().execute(
                "INSERT INTO record_sync (path, rev, cid) VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET rev = excluded.rev, cid = excluded.cid",
                params![path, rev, cid],
            )
        })
        .await
        .with_context(|| format!("Failed to index record {}", path))?;
        Ok(())
    }

    /// Record a deletion: the row stays behind as a tombstone.
    pub async fn delete(&self, path: &str, rev: &str) -> Result<()> {
        execute_with_retry(&self.retry, || {
            self.conn().execute(
                "INSERT INTO record_sync (path, rev, cid) VALUES (?1, ?2, NULL)
                 ON CONFLICT(path) DO UPDATE SET rev = excluded.rev, cid = NULL",
                params![path, rev],
            )
        })
        .await
        .with_context(|| format!("Failed to tombstone record {}", path))?;
        Ok(())
    }

    /// Fetch one path's entry.
    pub fn get(&self, path: &str) -> Result<Option<RecordEntry>> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                "SELECT path, rev, cid FROM record_sync WHERE path = ?1",
                params![path],
                entry_from_sql,
            )
            .optional()
            .with_context(|| format!("Failed to read record entry for {}", path))?;
        Ok(entry)
    }

    /// One page of entries ordered `(rev ASC, path ASC)`, filtered by cursor.
    ///
    /// A full cursor admits entries strictly after its `(rev, path)`; a
    /// bare `since` boundary admits only strictly later revs.
    pub fn page(&self, cursor: Option<&RecordCursor>, limit: usize) -> Result<Vec<RecordEntry>> {
        let conn = self.conn();
        let page: rusqlite::Result<Vec<RecordEntry>> = match cursor {
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT path, rev, cid FROM record_sync
                     ORDER BY rev ASC, path ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], entry_from_sql)?;
                rows.collect()
            }
            Some(RecordCursor { rev, path: Some(path) }) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT path, rev, cid FROM record_sync
                     WHERE rev > ?1 OR (rev = ?1 AND path > ?2)
                     ORDER BY rev ASC, path ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![rev, path, limit as i64], entry_from_sql)?;
                rows.collect()
            }
            Some(RecordCursor { rev, path: None }) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT path, rev, cid FROM record_sync
                     WHERE rev > ?1
                     ORDER BY rev ASC, path ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![rev, limit as i64], entry_from_sql)?;
                rows.collect()
            }
        };
        page.context("Failed to read record page")
    }

    /// Number of indexed paths, tombstones included.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM record_sync", [], |r| r.get(0))?;
        Ok(count as u64)
    }
}

fn entry_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordEntry> {
    Ok(RecordEntry {
        path: row.get(0)?,
        rev: row.get(1)?,
        cid: row.get(2)?,
    })
}
