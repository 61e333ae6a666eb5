//! SQLite helpers shared by the revision and record-sync stores.
//!
//! Both tables are opened in WAL mode so independent writer and reader
//! processes can share the files. Write transactions that lose a race are
//! retried with backoff by `execute_with_retry`; the stores never take
//! application-level locks.

use crate::config::RetryConfig;
use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub(crate) fn open_feed_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(conn)
}

/// True for the serialization failures a retried transaction can clear.
fn is_write_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Run a write transaction, retrying write conflicts with linear backoff.
///
/// `op` must be safe to re-run from scratch: it is called once per attempt.
/// Once the retries are exhausted the underlying error surfaces to the caller.
pub async fn execute_with_retry<T, F>(retry: &RetryConfig, mut op: F) -> rusqlite::Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_write_conflict(&err) && attempt < retry.max_retries => {
                attempt += 1;
                let delay = retry.backoff_ms.saturating_mul(attempt as u64);
                tracing::debug!(
                    "write conflict, retrying in {}ms (attempt {}/{})",
                    delay,
                    attempt,
                    retry.max_retries
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
