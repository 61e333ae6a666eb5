//! Core value types for the change feed.
//!
//! Content ids, hosting status, the two durable row shapes, and the
//! ordered cursor keys used to resume pagination.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Content identifier: SHA-256 over a block's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Create a Cid from raw hash bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the Cid of a block
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ToSql for Cid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_hex()))
    }
}

impl FromSql for Cid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Cid::from_hex(s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Hosting status of a repository. Absence means active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Takendown,
    Suspended,
    Deleted,
    Deactivated,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Takendown => "takendown",
            HostStatus::Suspended => "suspended",
            HostStatus::Deleted => "deleted",
            HostStatus::Deactivated => "deactivated",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "takendown" => Some(HostStatus::Takendown),
            "suspended" => Some(HostStatus::Suspended),
            "deleted" => Some(HostStatus::Deleted),
            "deactivated" => Some(HostStatus::Deactivated),
            _ => None,
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| anyhow::anyhow!("Unknown hosting status: {}", s))
    }
}

impl ToSql for HostStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for HostStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s).ok_or(FromSqlError::InvalidType)
    }
}

/// Latest revision state of one repository, as stored in the `revision` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRow {
    /// Repository identifier.
    pub did: String,
    /// Latest repo-assigned revision token.
    pub rev: String,
    /// Sequencer-assigned ordering number; strictly increases on every write.
    pub seq: i64,
    /// Identity token; changes when the repo's identity document changes.
    pub ident: Option<String>,
    /// Hosting status; None means active.
    pub status: Option<HostStatus>,
}

/// One record path's latest mutation, as stored in the `record_sync` table.
/// `cid = None` is a tombstone: the record was deleted at `rev` and the row
/// is retained so late syncs still observe the deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    /// Record path (`collection/rkey`) within the repository's namespace.
    pub path: String,
    /// Revision token of the last mutation to this path.
    pub rev: String,
    /// Content id of the current value, or None once deleted.
    pub cid: Option<Cid>,
}

/// Resumption point in the `(seq, did)`-ordered revision stream.
///
/// A bare boundary (`did = None`) marks the position just before every row
/// at that seq, so "rows strictly after the cursor" includes rows whose seq
/// equals the boundary. A full cursor resumes strictly after one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionCursor {
    pub seq: i64,
    pub did: Option<String>,
}

impl RevisionCursor {
    /// Boundary form: admit rows with `seq >= boundary`.
    pub fn seq_only(seq: i64) -> Self {
        Self { seq, did: None }
    }

    /// Full form: admit rows strictly after `(seq, did)`.
    pub fn at(seq: i64, did: impl Into<String>) -> Self {
        Self {
            seq,
            did: Some(did.into()),
        }
    }

    /// Cursor positioned exactly at a delivered row.
    pub fn for_row(row: &RevisionRow) -> Self {
        Self::at(row.seq, row.did.clone())
    }
}

impl Ord for RevisionCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        // An absent did orders before every present did, which makes the
        // page filter a single strict tuple comparison in both cursor forms.
        self.seq.cmp(&other.seq).then_with(|| match (&self.did, &other.did) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        })
    }
}

impl PartialOrd for RevisionCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Resumption point in the `(rev, path)`-ordered record diff stream.
///
/// A bare boundary (`path = None`) is a `since` revision: it marks the
/// position after every row at that rev, so only rows with a strictly
/// later rev are admitted. A full cursor resumes strictly after one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCursor {
    pub rev: String,
    pub path: Option<String>,
}

impl RecordCursor {
    /// Boundary form: admit rows with `rev` strictly greater.
    pub fn since(rev: impl Into<String>) -> Self {
        Self {
            rev: rev.into(),
            path: None,
        }
    }

    /// Full form: admit rows strictly after `(rev, path)`.
    pub fn at(rev: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            rev: rev.into(),
            path: Some(path.into()),
        }
    }

    /// Cursor positioned exactly at a delivered entry.
    pub fn for_entry(entry: &RecordEntry) -> Self {
        Self::at(entry.rev.clone(), entry.path.clone())
    }
}

impl Ord for RecordCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        // An absent path orders after every present path: a bare `since`
        // boundary excludes the whole revision it names.
        self.rev.cmp(&other.rev).then_with(|| match (&self.path, &other.path) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        })
    }
}

impl PartialOrd for RecordCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
