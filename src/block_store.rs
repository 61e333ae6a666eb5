//! Collaborator seams for the logical sync stream.
//!
//! The Merkle tree and block persistence live elsewhere in the host; the
//! stream only needs narrow read access to blocks and the current root,
//! plus a byte decoder for block payloads.

use crate::types::Cid;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

/// Content-addressed block reads.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Fetch a block's bytes; Ok(None) when the store holds no such block.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>>;
}

/// Current Merkle root pointer per repository.
#[async_trait]
pub trait RootStore: Send + Sync {
    /// The root hash and its commit block, or None for an unknown did.
    async fn get_root(&self, did: &str) -> Result<Option<(Cid, Bytes)>>;
}

/// Byte → structured-record decoder for block payloads.
pub trait BlockDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Decoder for JSON-encoded blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonBlockDecoder;

impl BlockDecoder for JsonBlockDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).context("Failed to decode block as JSON")
    }
}

#[derive(Default)]
struct MemoryInner {
    blocks: HashMap<Cid, Bytes>,
    roots: HashMap<String, (Cid, Bytes)>,
}

/// In-memory block and root store, for tests and embedders.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block under its content hash; returns the hash.
    pub fn put_block(&self, data: impl Into<Bytes>) -> Cid {
        let data = data.into();
        let cid = Cid::from_data(&data);
        self.inner.write().unwrap().blocks.insert(cid, data);
        cid
    }

    /// Point a repository's root at a commit block, storing the block too.
    pub fn set_root(&self, did: &str, commit: impl Into<Bytes>) -> Cid {
        let commit = commit.into();
        let cid = Cid::from_data(&commit);
        let mut inner = self.inner.write().unwrap();
        inner.blocks.insert(cid, commit.clone());
        inner.roots.insert(did.to_string(), (cid, commit));
        cid
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self.inner.read().unwrap().blocks.get(cid).cloned())
    }
}

#[async_trait]
impl RootStore for MemoryBlockStore {
    async fn get_root(&self, did: &str) -> Result<Option<(Cid, Bytes)>> {
        Ok(self.inner.read().unwrap().roots.get(did).cloned())
    }
}
