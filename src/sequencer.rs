//! Write API over the revision store.
//!
//! Each operation runs one retried upsert transaction and then fires a
//! single wake signal. Writers and subscribers may live in different
//! processes; the only coordination is the durable table plus the wake
//! file.

use crate::config::RetryConfig;
use crate::db::execute_with_retry;
use crate::notifier::Notifier;
use crate::revision_store::RevisionStore;
use crate::types::HostStatus;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Assigns sequence numbers to repository state changes and wakes
/// subscribers after each durable commit.
pub struct Sequencer {
    store: Arc<RevisionStore>,
    notifier: Notifier,
    retry: RetryConfig,
}

impl Sequencer {
    pub fn new(store: Arc<RevisionStore>, notifier: Notifier, retry: RetryConfig) -> Self {
        Self {
            store,
            notifier,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<RevisionStore> {
        &self.store
    }

    /// The wake signal fired after every write; subscribers watch through it.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Create or reconcile a repository's row, overwriting all fields.
    pub async fn init(
        &self,
        did: &str,
        rev: &str,
        ident: Option<&str>,
        status: Option<HostStatus>,
    ) -> Result<i64> {
        let seq = execute_with_retry(&self.retry, || {
            self.store.upsert_init(did, rev, ident, status, next_seq)
        })
        .await
        .with_context(|| format!("Failed to initialize revision row for {}", did))?;
        tracing::debug!(did, rev, seq, "sequenced init");
        self.notifier.update();
        Ok(seq)
    }

    /// Record a new repository revision.
    pub async fn commit(&self, did: &str, rev: &str) -> Result<i64> {
        let seq = execute_with_retry(&self.retry, || self.store.upsert_commit(did, rev, next_seq))
            .await
            .with_context(|| format!("Failed to sequence commit for {}", did))?;
        tracing::debug!(did, rev, seq, "sequenced commit");
        self.notifier.update();
        Ok(seq)
    }

    /// Record an identity-document change. With no explicit token a fresh
    /// opaque one is minted; tokens are only ever compared for equality.
    /// Returns None (and stays silent) when the did has no row yet.
    pub async fn identity(&self, did: &str, ident: Option<&str>) -> Result<Option<i64>> {
        let token = match ident {
            Some(t) => t.to_string(),
            None => fresh_ident(),
        };
        let seq = execute_with_retry(&self.retry, || {
            self.store.update_ident(did, Some(&token), next_seq)
        })
        .await
        .with_context(|| format!("Failed to sequence identity change for {}", did))?;
        match seq {
            Some(seq) => {
                tracing::debug!(did, seq, "sequenced identity change");
                self.notifier.update();
            }
            None => tracing::debug!(did, "identity change for unknown did ignored"),
        }
        Ok(seq)
    }

    /// Record a hosting-status change; None restores active status.
    /// Returns None (and stays silent) when the did has no row yet.
    pub async fn status(&self, did: &str, status: Option<HostStatus>) -> Result<Option<i64>> {
        let seq = execute_with_retry(&self.retry, || {
            self.store.update_status(did, status, next_seq)
        })
        .await
        .with_context(|| format!("Failed to sequence status change for {}", did))?;
        match seq {
            Some(seq) => {
                tracing::debug!(did, ?status, seq, "sequenced status change");
                self.notifier.update();
            }
            None => tracing::debug!(did, "status change for unknown did ignored"),
        }
        Ok(seq)
    }

    /// Stop the notifier's background watcher. Idempotent.
    pub fn destroy(&self) {
        self.notifier.destroy();
    }
}

/// Next sequence number for a row: wall-clock millis for cross-repo
/// pagination locality, clamped to strictly increase per row even when
/// the clock steps backwards.
pub(crate) fn next_seq(prev: Option<i64>) -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    match prev {
        Some(prev) => now.max(prev + 1),
        None => now,
    }
}

fn fresh_ident() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
