//! Live change-notification subscription: backfill, then tail.
//!
//! An explicit state machine: `Backfilling` drains everything durable,
//! `AwaitingWake` blocks on the notifier, `Draining` re-pulls after a
//! wake, and the loop returns to `AwaitingWake` — terminal only on
//! cancellation. A wake is never trusted to describe *what* changed;
//! every wake triggers a full re-pull from the current cursor, which is
//! also what makes coalesced or delayed wakes lossless: the rows are in
//! the table, the signal only schedules the next pull.

use crate::notifier::WakeStream;
use crate::pager::RevisionPager;
use crate::types::{HostStatus, RevisionCursor, RevisionRow};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Rejection of a subscription before any output.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The externally supplied resumption value did not parse as an integer.
    #[error("invalid resumption cursor: {0:?}")]
    InvalidCursor(String),
}

/// One change notification on the wire.
///
/// `ident` and `status` are omitted (not null) when the underlying row
/// holds no value; `seq` is stringified to stay JSON-safe for consumers
/// without 64-bit integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub seq: String,
    pub did: String,
    pub rev: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ident: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HostStatus>,
}

impl ChangeMessage {
    fn from_row(row: RevisionRow) -> Self {
        Self {
            seq: row.seq.to_string(),
            did: row.did,
            rev: row.rev,
            ident: row.ident,
            status: row.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Backfilling,
    AwaitingWake,
    Draining,
}

/// Unbounded, cancellable sequence of change messages for one subscriber.
pub struct SubscriptionStream {
    pager: RevisionPager,
    wake: WakeStream,
    cancel: CancellationToken,
    cursor: Option<RevisionCursor>,
    buf: VecDeque<RevisionRow>,
    state: State,
}

impl SubscriptionStream {
    /// Open a subscription, validating the resumption value up front.
    ///
    /// `resume` is the raw client-supplied cursor: an integer string
    /// resumes at that seq (inclusive), absent starts from the beginning
    /// of retained history. A malformed value rejects the subscription
    /// before any message is produced.
    pub fn new(
        pager: RevisionPager,
        wake: WakeStream,
        resume: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Self, SubscribeError> {
        let cursor = match resume {
            Some(raw) => {
                let seq = raw
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| SubscribeError::InvalidCursor(raw.to_string()))?;
                Some(RevisionCursor::seq_only(seq))
            }
            None => None,
        };
        Ok(Self {
            pager,
            wake,
            cancel,
            cursor,
            buf: VecDeque::new(),
            state: State::Backfilling,
        })
    }

    /// Next change message; None once cancellation is observed (also when
    /// the notifier goes away, since the tail can no longer be woken).
    pub async fn next(&mut self) -> Result<Option<ChangeMessage>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(row) = self.buf.pop_front() {
                self.cursor = Some(RevisionCursor::for_row(&row));
                return Ok(Some(ChangeMessage::from_row(row)));
            }
            match self.state {
                State::Backfilling | State::Draining => {
                    let page = self.pager.get_page(self.cursor.as_ref())?;
                    if page.is_empty() {
                        tracing::trace!("revision page empty, awaiting wake");
                        self.state = State::AwaitingWake;
                    } else {
                        self.buf.extend(page);
                    }
                }
                State::AwaitingWake => match self.wake.recv(&self.cancel).await {
                    // A wake may stand for many writes, or for writes that
                    // landed before we subscribed: drain from the cursor
                    // regardless.
                    Some(()) => self.state = State::Draining,
                    None => return Ok(None),
                },
            }
        }
    }

    /// Position after the last delivered message.
    pub fn cursor(&self) -> Option<&RevisionCursor> {
        self.cursor.as_ref()
    }
}
