//! End-to-end tests for the logical diff stream: replaying a full stream
//! (initial root, diffs, optional trailing root) into an empty tree must
//! reproduce the content digest carried by the last emitted root
//! checkpoint, including while a writer keeps committing.

use drydock_feed::{
    Cid, DiffEntry, JsonBlockDecoder, LogicalSync, MemoryBlockStore, RecordIndex, RetryConfig,
    SyncStream,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Digest standing in for the Merkle root pointer: the tree algorithm
/// itself lives behind the root-store collaborator, so any deterministic
/// function of the `(path, cid)` set works for verification.
fn tree_digest(tree: &BTreeMap<String, Cid>) -> String {
    let mut hasher = Sha256::new();
    for (path, cid) in tree {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(cid.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn commit_block(rev: &str, tree: &BTreeMap<String, Cid>) -> Vec<u8> {
    serde_json::to_vec(&json!({"rev": rev, "data": tree_digest(tree)})).unwrap()
}

async fn drain(mut stream: SyncStream<'_>) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    while let Some(entry) = stream.next().await.unwrap() {
        entries.push(entry);
    }
    entries
}

/// Apply a diff sequence to a tree, verifying every block against its
/// advertised cid on the way.
fn apply_diffs(tree: &mut BTreeMap<String, Cid>, entries: &[DiffEntry]) {
    for entry in entries {
        entry.validate().unwrap();
        if let (Some(cid), Some(block)) = (&entry.cid, &entry.block) {
            let bytes = serde_json::to_vec(block).unwrap();
            assert_eq!(*cid, Cid::from_data(&bytes), "cid does not match block");
        }
        let Some(path) = &entry.path else { continue };
        match entry.cid {
            Some(cid) => {
                tree.insert(path.clone(), cid);
            }
            None => {
                tree.remove(path);
            }
        }
    }
}

/// The root checkpoint a consumer verifies against: the trailing one when
/// present, the initial one otherwise.
fn sync_root(entries: &[DiffEntry]) -> &DiffEntry {
    let root = match entries.last() {
        Some(last) if last.is_root() => last,
        _ => entries.first().expect("stream always starts with a root"),
    };
    assert!(root.is_root());
    root
}

fn assert_matching_root(tree: &BTreeMap<String, Cid>, entries: &[DiffEntry]) {
    let root = sync_root(entries);
    let block = root.block.as_ref().unwrap();
    assert_eq!(block["data"], json!(tree_digest(tree)));
}

fn root_rev(entries: &[DiffEntry]) -> String {
    sync_root(entries).block.as_ref().unwrap()["rev"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_replay_reproduces_root_across_revisions() {
    let tmp = TempDir::new().unwrap();
    let index =
        RecordIndex::open(&tmp.path().join("records.sqlite"), RetryConfig::default()).unwrap();
    let store = MemoryBlockStore::new();
    let decoder = JsonBlockDecoder;

    // ten records over ten revisions
    let mut written = BTreeMap::new();
    for i in 0..10 {
        let rev = format!("3k{:03}", i + 1);
        let path = format!("posts/{:03}", i);
        let cid =
            store.put_block(serde_json::to_vec(&json!({"text": format!("post {i}")})).unwrap());
        index.put(&path, &rev, &cid).await.unwrap();
        written.insert(path, cid);
        store.set_root("did:alice", commit_block(&rev, &written));
    }

    let entries = drain(
        LogicalSync::new(&index, &store, &store, &decoder)
            .with_batch_size(3)
            .stream("did:alice", None, None, CancellationToken::new()),
    )
    .await;
    let mut tree = BTreeMap::new();
    apply_diffs(&mut tree, &entries);
    assert_matching_root(&tree, &entries);
    assert_eq!(tree.len(), 10);

    // delete three, add two, then resume from the synced revision
    let since = root_rev(&entries);
    for i in 0..3 {
        let rev = format!("3k{:03}", 11 + i);
        let path = format!("posts/{:03}", i);
        index.delete(&path, &rev).await.unwrap();
        written.remove(&path);
        store.set_root("did:alice", commit_block(&rev, &written));
    }
    for i in 0..2 {
        let rev = format!("3k{:03}", 14 + i);
        let path = format!("posts/new{}", i);
        let cid =
            store.put_block(serde_json::to_vec(&json!({"text": format!("new {i}")})).unwrap());
        index.put(&path, &rev, &cid).await.unwrap();
        written.insert(path, cid);
        store.set_root("did:alice", commit_block(&rev, &written));
    }

    let entries = drain(
        LogicalSync::new(&index, &store, &store, &decoder)
            .with_batch_size(3)
            .stream("did:alice", Some(since.as_str()), None, CancellationToken::new()),
    )
    .await;
    apply_diffs(&mut tree, &entries);
    assert_matching_root(&tree, &entries);
    assert_eq!(tree.len(), 10 - 3 + 2);

    // the three deletions arrive as pure tombstones
    let tombstones: Vec<&DiffEntry> = entries
        .iter()
        .filter(|e| e.path.is_some() && e.cid.is_none())
        .collect();
    assert_eq!(tombstones.len(), 3);
    for tomb in tombstones {
        assert!(tomb.block.is_none());
    }

    // no-op sync from the latest revision: exactly one root, no trailing
    let since = root_rev(&entries);
    let entries = drain(
        LogicalSync::new(&index, &store, &store, &decoder)
            .with_batch_size(3)
            .stream("did:alice", Some(since.as_str()), None, CancellationToken::new()),
    )
    .await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_root());
    apply_diffs(&mut tree, &entries);
    assert_matching_root(&tree, &entries);
}

#[tokio::test]
async fn test_trailing_root_emitted_when_root_moves_mid_stream() {
    let tmp = TempDir::new().unwrap();
    let index =
        RecordIndex::open(&tmp.path().join("records.sqlite"), RetryConfig::default()).unwrap();
    let store = MemoryBlockStore::new();
    let decoder = JsonBlockDecoder;

    let mut written = BTreeMap::new();
    let c1 = store.put_block(serde_json::to_vec(&json!({"n": 1})).unwrap());
    index.put("posts/1", "3k1", &c1).await.unwrap();
    written.insert("posts/1".to_string(), c1);
    let initial_root = store.set_root("did:a", commit_block("3k1", &written));

    let mut stream = LogicalSync::new(&index, &store, &store, &decoder).stream(
        "did:a",
        None,
        None,
        CancellationToken::new(),
    );
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.cid, Some(initial_root));

    // a writer lands a record and a new root while the stream is mid-flight
    let c2 = store.put_block(serde_json::to_vec(&json!({"n": 2})).unwrap());
    index.put("posts/2", "3k2", &c2).await.unwrap();
    written.insert("posts/2".to_string(), c2);
    let moved_root = store.set_root("did:a", commit_block("3k2", &written));

    let mut entries = vec![first];
    while let Some(entry) = stream.next().await.unwrap() {
        entries.push(entry);
    }

    // both records delivered, and the stream closes with the moved root
    let last = entries.last().unwrap();
    assert!(last.is_root());
    assert_eq!(last.cid, Some(moved_root));
    let mut tree = BTreeMap::new();
    apply_diffs(&mut tree, &entries);
    assert_matching_root(&tree, &entries);
    assert_eq!(tree.len(), 2);
}

#[tokio::test]
async fn test_sync_under_concurrent_writes() {
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(
        RecordIndex::open(&tmp.path().join("records.sqlite"), RetryConfig::default()).unwrap(),
    );
    let store = Arc::new(MemoryBlockStore::new());
    let decoder = JsonBlockDecoder;

    // a decent amount of backfill
    let mut written = BTreeMap::new();
    for i in 0..40 {
        let rev = format!("3k{:04}", i + 1);
        let path = format!("posts/{:04}", i);
        let cid = store.put_block(serde_json::to_vec(&json!({"i": i})).unwrap());
        index.put(&path, &rev, &cid).await.unwrap();
        written.insert(path, cid);
        store.set_root("did:bob", commit_block(&rev, &written));
    }

    // continuous writing: record first, then the root that covers it
    let done = CancellationToken::new();
    let writer = tokio::spawn({
        let index = index.clone();
        let store = store.clone();
        let done = done.clone();
        async move {
            let mut written = written;
            for i in 40..100 {
                let rev = format!("3k{:04}", i + 1);
                let path = format!("posts/{:04}", i);
                let cid = store.put_block(serde_json::to_vec(&json!({"i": i})).unwrap());
                index.put(&path, &rev, &cid).await.unwrap();
                written.insert(path, cid);
                store.set_root("did:bob", commit_block(&rev, &written));
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            done.cancel();
        }
    });

    // continuous syncing: every completed pass must verify against the
    // root it closed on, whatever the writer did in the meantime
    let mut tree = BTreeMap::new();
    let mut since: Option<String> = None;
    loop {
        let finished = done.is_cancelled();
        let entries = drain(
            LogicalSync::new(&index, &*store, &*store, &decoder)
                .with_batch_size(7)
                .stream("did:bob", since.as_deref(), None, CancellationToken::new()),
        )
        .await;
        apply_diffs(&mut tree, &entries);
        assert_matching_root(&tree, &entries);
        since = Some(root_rev(&entries));
        if finished {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    writer.await.unwrap();

    assert_eq!(tree.len(), 100);
}
