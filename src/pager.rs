//! Ordered, cursor-resumable reads over the revision table.

use crate::config::FeedConfig;
use crate::revision_store::RevisionStore;
use crate::types::{RevisionCursor, RevisionRow};
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PAGE_SIZE: usize = 250;

/// Read API producing `(seq, did)`-ordered pages and finite backfill
/// passes over the revision table.
#[derive(Clone)]
pub struct RevisionPager {
    store: Arc<RevisionStore>,
    page_size: usize,
}

impl RevisionPager {
    pub fn new(store: Arc<RevisionStore>) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_config(self, config: &FeedConfig) -> Self {
        self.with_page_size(config.page_size)
    }

    /// One page of rows strictly after the cursor (see `RevisionStore::page`).
    pub fn get_page(&self, cursor: Option<&RevisionCursor>) -> Result<Vec<RevisionRow>> {
        self.store.page(cursor, self.page_size)
    }

    /// A single finite pass over currently-durable rows: pages forward from
    /// the cursor and stops, without waiting, at the first empty page.
    pub fn latest(&self, cursor: Option<RevisionCursor>) -> Backfill<'_> {
        Backfill {
            pager: self,
            cursor,
            buf: VecDeque::new(),
            done: false,
        }
    }
}

/// Lazy iterator state for one backfill pass.
pub struct Backfill<'a> {
    pager: &'a RevisionPager,
    cursor: Option<RevisionCursor>,
    buf: VecDeque<RevisionRow>,
    done: bool,
}

impl Backfill<'_> {
    /// Next row, or None once a page comes back empty or cancel fires.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<RevisionRow>> {
        loop {
            if self.done || cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(row) = self.buf.pop_front() {
                self.cursor = Some(RevisionCursor::for_row(&row));
                return Ok(Some(row));
            }
            let page = self.pager.get_page(self.cursor.as_ref())?;
            if page.is_empty() {
                self.done = true;
                return Ok(None);
            }
            self.buf.extend(page);
        }
    }

    /// Position after the last delivered row; hand this to a later pass
    /// to resume where this one stopped.
    pub fn cursor(&self) -> Option<&RevisionCursor> {
        self.cursor.as_ref()
    }
}
