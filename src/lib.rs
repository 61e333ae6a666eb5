//! Drydock change-feed core
//!
//! Tracks, per hosted repository, the latest revision/identity/hosting
//! state, assigns each write a globally orderable sequence number, and
//! derives two consumer streams:
//! - a live, resumable subscription of change notifications
//!   (backfill-then-tail over the revision table, woken across process
//!   boundaries by a shared file), and
//! - a point-in-time, resumable diff stream of record mutations since a
//!   revision, bracketed by Merkle-root checkpoints for verification.
//!
//! HTTP routing, auth, schema validation, the Merkle tree and block
//! persistence are collaborators behind narrow interfaces; this crate is
//! only the sequencing, notification, and diff core.

pub mod block_store;
pub mod config;
pub mod db;
pub mod logical_sync;
pub mod notifier;
pub mod pager;
pub mod record_index;
pub mod revision_store;
pub mod sequencer;
pub mod subscription;
pub mod types;

pub use block_store::{BlockDecoder, BlockStore, JsonBlockDecoder, MemoryBlockStore, RootStore};
pub use config::{FeedConfig, RetryConfig};
pub use logical_sync::{DiffEntry, LogicalSync, SyncError, SyncStream};
pub use notifier::{Notifier, WakeStream};
pub use pager::{Backfill, RevisionPager};
pub use record_index::RecordIndex;
pub use revision_store::RevisionStore;
pub use sequencer::Sequencer;
pub use subscription::{ChangeMessage, SubscribeError, SubscriptionStream};
pub use types::{Cid, HostStatus, RecordCursor, RecordEntry, RevisionCursor, RevisionRow};
