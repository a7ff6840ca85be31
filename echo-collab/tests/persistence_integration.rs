//! Persistence integration tests.
//!
//! Verifies:
//! - Spaces survive closing and reopening the RocksDB store
//! - Snapshot plus tail replay equals full replay
//! - Changes received from a peer are durable
//! - Destroying a space removes its records

use echo_collab::replicator::{Replicator, ReplicatorConfig};
use echo_collab::storage::{RocksStore, StoreConfig};
use echo_collab::transport::PeerChannel;
use echo_core::{path, Capability, Change, ChangeStore, Identity, ObjKind, Space, SpaceBuilder, SpaceConfig, Value};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{sleep, timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn identity(n: u8) -> Identity {
    Identity::from_seed([n; 32])
}

fn open_store(path: &std::path::Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn config(use_snapshot: bool) -> SpaceConfig {
    SpaceConfig {
        use_snapshot,
        snapshot_interval: 0,
        ..SpaceConfig::default()
    }
}

fn assert_same_state(a: &Space, b: &Space) {
    assert_eq!(a.frontier(), b.frontier());
    assert_eq!(a.membership(), b.membership());
    assert_eq!(a.document_digests(), b.document_digests());
}

// ─── Reopen ──────────────────────────────────────────────────────────────────

#[test]
fn test_space_survives_store_reopen() {
    let dir = tempdir().unwrap();
    let (id, owner, doc, digests, frontier) = {
        let store = open_store(dir.path());
        let mut space = SpaceBuilder::new(identity(1)).store(store.clone()).create().unwrap();
        let doc = space.create_document(None).unwrap().document;
        space.local_mutate(doc, &path!["title"], "persisted").unwrap();
        space
            .mutate(doc, |tx| {
                tx.make(&path!["tags"], ObjKind::List)?;
                tx.insert(&path!["tags"], 0, "rust")
            })
            .unwrap();
        assert_eq!(store.change_count(space.id()).unwrap(), space.frontier().total());
        (space.id(), space.owner(), doc, space.document_digests(), space.frontier().clone())
    };

    let store = open_store(dir.path());
    assert_eq!(store.list_spaces().unwrap(), vec![id]);
    let reopened = SpaceBuilder::new(identity(1)).store(store).open(id, owner).unwrap();
    assert_eq!(reopened.frontier(), &frontier);
    assert_eq!(reopened.document_digests(), digests);
    assert_eq!(
        reopened.document(doc).unwrap().get(&path!["title"]),
        Some(Value::from("persisted"))
    );
}

#[test]
fn test_reopened_space_keeps_writing() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mut space = SpaceBuilder::new(identity(1)).store(store.clone()).create().unwrap();
    let doc = space.create_document(None).unwrap().document;
    space.local_mutate(doc, &path!["n"], 1i64).unwrap();
    let (id, owner) = (space.id(), space.owner());
    drop(space);

    let mut reopened = SpaceBuilder::new(identity(1)).store(store.clone()).open(id, owner).unwrap();
    reopened.local_mutate(doc, &path!["n"], 2i64).unwrap();
    let stored = store.load_changes(id).unwrap();
    let last: &Change = stored.last().unwrap();
    assert_eq!(last.seq, reopened.frontier().get(&identity(1).actor()));
    assert_eq!(store.change_count(id).unwrap(), stored.len() as u64);
}

#[test]
fn test_snapshot_replay_matches_full_replay() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mut space = SpaceBuilder::new(identity(1)).store(store.clone()).create().unwrap();
    let doc = space.create_document(None).unwrap().document;
    for i in 0..10i64 {
        space.local_mutate(doc, &path!["count"], i).unwrap();
    }
    space.snapshot().unwrap();
    for i in 10..15i64 {
        space.local_mutate(doc, &path!["count"], i).unwrap();
    }
    assert!(store.metadata(space.id()).unwrap().snapshot_size > 0);

    let (id, owner) = (space.id(), space.owner());
    let with_snapshot = SpaceBuilder::new(identity(1))
        .store(store.clone())
        .config(config(true))
        .open(id, owner)
        .unwrap();
    let full = SpaceBuilder::new(identity(1))
        .store(store)
        .config(config(false))
        .open(id, owner)
        .unwrap();
    assert_same_state(&with_snapshot, &full);
    assert_same_state(&with_snapshot, &space);
}

#[test]
fn test_destroy_removes_records() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mut space = SpaceBuilder::new(identity(1)).store(store.clone()).create().unwrap();
    space.create_document(None).unwrap();
    space.snapshot().unwrap();
    let id = space.id();

    space.destroy().unwrap();
    assert!(store.load_changes(id).unwrap().is_empty());
    assert_eq!(store.load_snapshot(id).unwrap(), None);
    assert!(store.list_spaces().unwrap().is_empty());
}

// ─── Replication into a durable replica ──────────────────────────────────────

#[tokio::test]
async fn test_received_changes_are_durable() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    let mut owner = SpaceBuilder::new(identity(1)).create().unwrap();
    owner.admit_member(identity(2).actor(), Capability::Write).unwrap();
    let doc = owner.create_document(None).unwrap().document;
    for i in 0..7i64 {
        owner.local_mutate(doc, &path!["v"], i).unwrap();
    }
    let (id, owner_actor) = (owner.id(), owner.owner());
    let member = SpaceBuilder::new(identity(2))
        .store(store.clone())
        .join(id, owner_actor)
        .unwrap();

    let (ra, rb) = (
        Replicator::new(ReplicatorConfig::for_testing()),
        Replicator::new(ReplicatorConfig::for_testing()),
    );
    let a = ra.add_space(owner).await.unwrap();
    let b = rb.add_space(member).await.unwrap();
    let (ch_a, ch_b) = PeerChannel::pair(64);
    ra.on_peer_connected(id, ch_a).await.unwrap();
    rb.on_peer_connected(id, ch_b).await.unwrap();

    let expected = a.lock().await.frontier().clone();
    let synced = timeout(Duration::from_secs(10), async {
        while *b.lock().await.frontier() != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(synced.is_ok());

    ra.shutdown().await;
    rb.remove_space(&id).await.unwrap();
    drop(b);

    let reopened = SpaceBuilder::new(identity(2)).store(store.clone()).open(id, owner_actor).unwrap();
    assert_eq!(reopened.frontier(), &expected);
    assert_eq!(store.change_count(id).unwrap(), expected.total());
    assert_eq!(
        reopened.document(doc).unwrap().get(&path!["v"]),
        Some(Value::from(6i64))
    );
}
