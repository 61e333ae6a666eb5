//! Durable per-repository revision state.
//!
//! One row per did: latest revision token, sequencer-assigned ordering
//! number, identity token, hosting status. Rows are created by `init`/
//! `commit`, mutated by every later sequencer write, and never deleted.
//! Each write op runs a single `BEGIN IMMEDIATE` read-modify-write so the
//! caller-supplied seq assignment sees the row's previous seq atomically.

use crate::db::open_feed_db;
use crate::types::{HostStatus, RevisionCursor, RevisionRow};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct RevisionStore {
    conn: Mutex<Connection>,
}

impl RevisionStore {
    /// Open or create the revision table at the given database path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_feed_db(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS revision (
                did TEXT PRIMARY KEY,
                rev TEXT NOT NULL,
                seq INTEGER NOT NULL,
                ident TEXT,
                status TEXT
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS revision_seq_did_idx ON revision (seq, did);",
        )
        .context("Failed to create revision table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn prev_seq(tx: &rusqlite::Transaction<'_>, did: &str) -> rusqlite::Result<Option<i64>> {
        tx.query_row("SELECT seq FROM revision WHERE did = ?1", params![did], |r| {
            r.get(0)
        })
        .optional()
    }

    /// Insert-or-overwrite the full row: idempotent reconciliation of a
    /// repository's state. `assign` maps the previous seq to the new one.
    pub fn upsert_init(
        &self,
        did: &str,
        rev: &str,
        ident: Option<&str>,
        status: Option<HostStatus>,
        assign: impl FnOnce(Option<i64>) -> i64,
    ) -> rusqlite::Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let seq = assign(Self::prev_seq(&tx, did)?);
        tx.execute(
            "INSERT INTO revision (did, rev, seq, ident, status) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(did) DO UPDATE SET
                 rev = excluded.rev, seq = excluded.seq,
                 ident = excluded.ident, status = excluded.status",
            params![did, rev, seq, ident, status],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    /// Upsert `rev` and `seq`, leaving identity and status untouched.
    pub fn upsert_commit(
        &self,
        did: &str,
        rev: &str,
        assign: impl FnOnce(Option<i64>) -> i64,
    ) -> rusqlite::Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let seq = assign(Self::prev_seq(&tx, did)?);
        tx.execute(
            "INSERT INTO revision (did, rev, seq) VALUES (?1, ?2, ?3)
             ON CONFLICT(did) DO UPDATE SET rev = excluded.rev, seq = excluded.seq",
            params![did, rev, seq],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    /// Update the identity token and `seq` on an existing row. Rows are
    /// only created by init/commit; returns None when the did is unknown.
    pub fn update_ident(
        &self,
        did: &str,
        ident: Option<&str>,
        assign: impl FnOnce(Option<i64>) -> i64,
    ) -> rusqlite::Result<Option<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(prev) = Self::prev_seq(&tx, did)? else {
            return Ok(None);
        };
        let seq = assign(Some(prev));
        tx.execute(
            "UPDATE revision SET ident = ?2, seq = ?3 WHERE did = ?1",
            params![did, ident, seq],
        )?;
        tx.commit()?;
        Ok(Some(seq))
    }

    /// Update the hosting status and `seq` on an existing row. Returns
    /// None when the did is unknown.
    pub fn update_status(
        &self,
        did: &str,
        status: Option<HostStatus>,
        assign: impl FnOnce(Option<i64>) -> i64,
    ) -> rusqlite::Result<Option<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(prev) = Self::prev_seq(&tx, did)? else {
            return Ok(None);
        };
        let seq = assign(Some(prev));
        tx.execute(
            "UPDATE revision SET status = ?2, seq = ?3 WHERE did = ?1",
            params![did, status, seq],
        )?;
        tx.commit()?;
        Ok(Some(seq))
    }

    /// Fetch one repository's row.
    pub fn get(&self, did: &str) -> Result<Option<RevisionRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT did, rev, seq, ident, status FROM revision WHERE did = ?1",
                params![did],
                row_from_sql,
            )
            .optional()
            .with_context(|| format!("Failed to read revision row for {}", did))?;
        Ok(row)
    }

    /// One page of rows ordered `(seq ASC, did ASC)`, filtered by cursor.
    ///
    /// A full cursor admits rows strictly after its `(seq, did)`; a bare
    /// seq boundary admits rows with `seq >= boundary`. The did tie-break
    /// matters because seq is not unique across rows.
    pub fn page(&self, cursor: Option<&RevisionCursor>, limit: usize) -> Result<Vec<RevisionRow>> {
        let conn = self.conn();
        let page: rusqlite::Result<Vec<RevisionRow>> = match cursor {
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT did, rev, seq, ident, status FROM revision
                     ORDER BY seq ASC, did ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], row_from_sql)?;
                rows.collect()
            }
            Some(RevisionCursor { seq, did: Some(did) }) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT did, rev, seq, ident, status FROM revision
                     WHERE seq > ?1 OR (seq = ?1 AND did > ?2)
                     ORDER BY seq ASC, did ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![seq, did, limit as i64], row_from_sql)?;
                rows.collect()
            }
            Some(RevisionCursor { seq, did: None }) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT did, rev, seq, ident, status FROM revision
                     WHERE seq >= ?1
                     ORDER BY seq ASC, did ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![seq, limit as i64], row_from_sql)?;
                rows.collect()
            }
        };
        page.context("Failed to read revision page")
    }

    /// Number of repositories tracked.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM revision", [], |r| r.get(0))?;
        Ok(count as u64)
    }
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<RevisionRow> {
    Ok(RevisionRow {
        did: row.get(0)?,
        rev: row.get(1)?,
        seq: row.get(2)?,
        ident: row.get(3)?,
        status: row.get(4)?,
    })
}
