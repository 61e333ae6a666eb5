//! Point-in-time logical diff stream with Merkle-root checkpoints.
//!
//! Produces a finite, ordered, resumable sequence of record diffs for one
//! repository, bracketed by root checkpoints a consumer can verify the
//! applied sequence against. The stream never waits for new data beyond a
//! short pacing delay between page fetches: it drains what is durable,
//! proves the root stable, and stops.

use crate::block_store::{BlockDecoder, BlockStore, RootStore};
use crate::config::FeedConfig;
use crate::record_index::RecordIndex;
use crate::types::{Cid, RecordCursor, RecordEntry};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_SIZE: usize = 250;
pub const DEFAULT_PACING: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SyncError {
    /// The repository has no root pointer: there is no valid sync basis,
    /// so the call fails instead of producing an empty stream.
    #[error("no sync root for repository {0}")]
    MissingRoot(String),

    /// A live entry references a block the content-addressed store cannot
    /// produce. The store is corrupt; this must not masquerade as a
    /// deletion.
    #[error("missing block {cid} for record {path}")]
    MissingBlock { path: String, cid: Cid },

    /// An entry that breaks the encoding table, e.g. a tombstone carrying
    /// a block. Unreachable through the `DiffEntry` constructors.
    #[error("invalid diff entry for {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// One line of the diff stream. All three fields are always present on
/// the wire, `null` when absent.
///
/// | case            | path | cid  | block          |
/// |-----------------|------|------|----------------|
/// | root checkpoint | null | root | decoded commit |
/// | tombstone       | path | null | null           |
/// | shallow entry   | path | cid  | null           |
/// | record mutation | path | cid  | decoded record |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: Option<String>,
    pub cid: Option<Cid>,
    pub block: Option<serde_json::Value>,
}

impl DiffEntry {
    /// Root checkpoint: the repository's current root hash plus its
    /// decoded commit block.
    pub fn root(cid: Cid, block: serde_json::Value) -> Self {
        Self {
            path: None,
            cid: Some(cid),
            block: Some(block),
        }
    }

    /// Deletion: path only, never a cid or block.
    pub fn tombstone(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            cid: None,
            block: None,
        }
    }

    /// Shallow entry: proves the path's existence and hash without
    /// disclosing content.
    pub fn shallow(path: impl Into<String>, cid: Cid) -> Self {
        Self {
            path: Some(path.into()),
            cid: Some(cid),
            block: None,
        }
    }

    /// Full record mutation.
    pub fn record(path: impl Into<String>, cid: Cid, block: serde_json::Value) -> Self {
        Self {
            path: Some(path.into()),
            cid: Some(cid),
            block: Some(block),
        }
    }

    /// True for root checkpoints.
    pub fn is_root(&self) -> bool {
        self.path.is_none()
    }

    /// Defensive check of the encoding table: a block always implies a
    /// cid, and a root checkpoint always carries both.
    pub fn validate(&self) -> Result<(), SyncError> {
        match (&self.path, &self.cid, &self.block) {
            (Some(path), None, Some(_)) => Err(SyncError::InvariantViolation(path.clone())),
            (None, None, _) | (None, _, None) => {
                Err(SyncError::InvariantViolation("root".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Serialize as one newline-terminated JSON object, failing fast on
    /// entries that break the encoding table.
    pub fn to_json_line(&self) -> Result<String, SyncError> {
        self.validate()?;
        let mut line = serde_json::to_string(self)
            .map_err(|e| SyncError::Storage(anyhow::Error::new(e)))?;
        line.push('\n');
        Ok(line)
    }
}

/// Diff-stream source: the record index plus the block/root collaborators.
#[derive(Clone, Copy)]
pub struct LogicalSync<'a> {
    index: &'a RecordIndex,
    blocks: &'a dyn BlockStore,
    roots: &'a dyn RootStore,
    decoder: &'a dyn BlockDecoder,
    batch_size: usize,
    pacing: Duration,
}

impl<'a> LogicalSync<'a> {
    pub fn new(
        index: &'a RecordIndex,
        blocks: &'a dyn BlockStore,
        roots: &'a dyn RootStore,
        decoder: &'a dyn BlockDecoder,
    ) -> Self {
        Self {
            index,
            blocks,
            roots,
            decoder,
            batch_size: DEFAULT_BATCH_SIZE,
            pacing: DEFAULT_PACING,
        }
    }

    pub fn with_config(mut self, config: &FeedConfig) -> Self {
        self.batch_size = config.sync_batch_size;
        self.pacing = Duration::from_millis(config.sync_pacing_ms);
        self
    }

    /// Per-call batch-size override.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Open the diff stream for one repository. `since` resumes after the
    /// given revision; `collection` withholds content (not paths) outside
    /// `"{collection}/"`.
    pub fn stream(
        self,
        did: &str,
        since: Option<&str>,
        collection: Option<&str>,
        cancel: CancellationToken,
    ) -> SyncStream<'a> {
        SyncStream {
            src: self,
            did: did.to_string(),
            collection: collection.map(str::to_string),
            cancel,
            cursor: since.map(RecordCursor::since),
            buf: VecDeque::new(),
            state: State::Start,
            initial_root: None,
            seen_root: None,
            paced: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Paging,
    Done,
}

/// Finite, cancellable diff sequence for one repository.
pub struct SyncStream<'a> {
    src: LogicalSync<'a>,
    did: String,
    collection: Option<String>,
    cancel: CancellationToken,
    cursor: Option<RecordCursor>,
    buf: VecDeque<RecordEntry>,
    state: State,
    initial_root: Option<Cid>,
    seen_root: Option<Cid>,
    paced: bool,
}

impl SyncStream<'_> {
    /// Next diff entry; None at the end of the stream or on cancellation.
    pub async fn next(&mut self) -> Result<Option<DiffEntry>, SyncError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            match self.state {
                State::Start => {
                    let (cid, block) = self.fetch_root().await?;
                    self.initial_root = Some(cid);
                    self.seen_root = Some(cid);
                    self.state = State::Paging;
                    return Ok(Some(DiffEntry::root(cid, block)));
                }
                State::Paging => {
                    if let Some(entry) = self.buf.pop_front() {
                        self.cursor = Some(RecordCursor::for_entry(&entry));
                        return Ok(Some(self.encode(entry).await?));
                    }
                    // pacing between page fetches; bounds how fast the
                    // empty-page loop re-polls
                    if self.paced && !self.pace().await {
                        return Ok(None);
                    }
                    self.paced = true;
                    let page = self
                        .src
                        .index
                        .page(self.cursor.as_ref(), self.src.batch_size)?;
                    if page.is_empty() {
                        let (cid, block) = self.fetch_root().await?;
                        if Some(cid) == self.seen_root {
                            // root stable across consecutive empty-page
                            // checks: every durable row up to it has been
                            // emitted
                            self.state = State::Done;
                            if self.initial_root != Some(cid) {
                                tracing::debug!(did = %self.did, root = %cid, "emitting trailing root");
                                return Ok(Some(DiffEntry::root(cid, block)));
                            }
                            return Ok(None);
                        }
                        // the root moved while paging: rows for the newer
                        // root lie past the cursor, keep going
                        tracing::debug!(did = %self.did, root = %cid, "root moved, continuing");
                        self.seen_root = Some(cid);
                    } else {
                        self.buf.extend(page);
                    }
                }
                State::Done => return Ok(None),
            }
        }
    }

    async fn fetch_root(&self) -> Result<(Cid, serde_json::Value), SyncError> {
        let (cid, bytes) = self
            .src
            .roots
            .get_root(&self.did)
            .await?
            .ok_or_else(|| SyncError::MissingRoot(self.did.clone()))?;
        let block = self.src.decoder.decode(&bytes)?;
        Ok((cid, block))
    }

    async fn encode(&self, entry: RecordEntry) -> Result<DiffEntry, SyncError> {
        let Some(cid) = entry.cid else {
            return Ok(DiffEntry::tombstone(entry.path));
        };
        if let Some(collection) = &self.collection {
            if !entry
                .path
                .starts_with(&format!("{}/", collection))
            {
                return Ok(DiffEntry::shallow(entry.path, cid));
            }
        }
        let bytes = self
            .src
            .blocks
            .get(&cid)
            .await?
            .ok_or_else(|| SyncError::MissingBlock {
                path: entry.path.clone(),
                cid,
            })?;
        let block = self.src.decoder.decode(&bytes)?;
        Ok(DiffEntry::record(entry.path, cid, block))
    }

    async fn pace(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.src.pacing) => true,
        }
    }
}
