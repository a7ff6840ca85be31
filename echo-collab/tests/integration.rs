//! Integration tests for replication between replicators.
//!
//! These tests run real session tasks over in-memory channels and over
//! WebSockets, verifying the full sync pipeline.

use echo_collab::client::{ConnectionState, SyncClient};
use echo_collab::replicator::{Replicator, ReplicatorConfig};
use echo_collab::server::{ServerConfig, SyncServer};
use echo_collab::session::SessionState;
use echo_collab::transport::PeerChannel;
use echo_collab::SharedSpace;
use echo_core::{path, Capability, Change, DocumentId, Identity, Space, SpaceBuilder, Value};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn identity(n: u8) -> Identity {
    Identity::from_seed([n; 32])
}

fn replicator() -> Arc<Replicator> {
    Arc::new(Replicator::new(ReplicatorConfig::for_testing()))
}

/// Owner space with `members` admitted as writers and one document.
fn owner_space(members: &[u8]) -> (Space, DocumentId) {
    let mut space = SpaceBuilder::new(identity(1)).create().unwrap();
    for n in members {
        space.admit_member(identity(*n).actor(), Capability::Write).unwrap();
    }
    let doc = space.create_document(None).unwrap().document;
    (space, doc)
}

/// A replica of `of` that has already caught up by hand.
fn replica(of: &Space, n: u8) -> Space {
    let mut space = SpaceBuilder::new(identity(n)).join(of.id(), of.owner()).unwrap();
    let changes: Vec<Change> = of.changes_since(space.frontier()).cloned().collect();
    for change in changes {
        space.apply_remote(change).unwrap();
    }
    space
}

async fn write(space: &SharedSpace, doc: DocumentId, key: &str, count: i64) {
    let mut space = space.lock().await;
    for i in 0..count {
        space.local_mutate(doc, &path![key], i).unwrap();
    }
}

async fn converged(spaces: &[&SharedSpace]) -> bool {
    let first = spaces[0].lock().await.frontier().clone();
    for space in &spaces[1..] {
        if *space.lock().await.frontier() != first {
            return false;
        }
    }
    true
}

async fn wait_converged(spaces: &[&SharedSpace]) {
    let result = timeout(Duration::from_secs(10), async {
        while !converged(spaces).await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "replicas did not converge");
}

async fn connect(a: &Replicator, b: &Replicator, space: echo_core::SpaceId) {
    let (ch_a, ch_b) = PeerChannel::pair(64);
    a.on_peer_connected(space, ch_a).await.unwrap();
    b.on_peer_connected(space, ch_b).await.unwrap();
}

// ─── In-memory replication ───────────────────────────────────────────────────

#[tokio::test]
async fn test_two_replicas_exchange_missing_changes() {
    init_logger();
    let (owner, doc) = owner_space(&[2]);
    let member = replica(&owner, 2);
    let id = owner.id();

    let (ra, rb) = (replicator(), replicator());
    let a = ra.add_space(owner).await.unwrap();
    let b = rb.add_space(member).await.unwrap();

    // Five changes each, written while disconnected.
    write(&a, doc, "from_a", 5).await;
    write(&b, doc, "from_b", 5).await;
    assert!(!converged(&[&a, &b]).await);

    connect(&ra, &rb, id).await;
    wait_converged(&[&a, &b]).await;

    let doc_a = a.lock().await.document(doc).unwrap().value();
    let doc_b = b.lock().await.document(doc).unwrap().value();
    assert_eq!(doc_a, doc_b);
    assert_eq!(doc_a.get("from_a"), Some(&Value::from(4i64)));
    assert_eq!(doc_a.get("from_b"), Some(&Value::from(4i64)));
    assert_eq!(
        a.lock().await.document_digests(),
        b.lock().await.document_digests()
    );
}

#[tokio::test]
async fn test_no_change_is_sent_twice() {
    let (owner, doc) = owner_space(&[2]);
    let member = replica(&owner, 2);
    let id = owner.id();

    let (ra, rb) = (replicator(), replicator());
    let a = ra.add_space(owner).await.unwrap();
    let b = rb.add_space(member).await.unwrap();
    write(&a, doc, "x", 5).await;
    write(&b, doc, "y", 5).await;

    connect(&ra, &rb, id).await;
    wait_converged(&[&a, &b]).await;

    let counted = timeout(Duration::from_secs(5), async {
        while ra.monitor().snapshot().changes_sent < 5 || rb.monitor().snapshot().changes_sent < 5 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(counted.is_ok());

    // Several re-announce rounds later nothing was resent.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(ra.monitor().snapshot().changes_sent, 5);
    assert_eq!(rb.monitor().snapshot().changes_sent, 5);
    assert_eq!(ra.monitor().snapshot().changes_received, 5);
    assert_eq!(rb.monitor().snapshot().changes_received, 5);
}

#[tokio::test]
async fn test_live_edits_stream_after_sync() {
    let (owner, doc) = owner_space(&[2]);
    let member = replica(&owner, 2);
    let id = owner.id();

    let (ra, rb) = (replicator(), replicator());
    let a = ra.add_space(owner).await.unwrap();
    let b = rb.add_space(member).await.unwrap();
    connect(&ra, &rb, id).await;
    wait_converged(&[&a, &b]).await;

    for round in 0..3 {
        write(&a, doc, "round", round + 1).await;
        wait_converged(&[&a, &b]).await;
    }
    let value = b.lock().await.document(doc).unwrap().get(&path!["round"]);
    assert_eq!(value, Some(Value::from(2i64)));
}

#[tokio::test]
async fn test_changes_relay_through_hub() {
    let (owner, doc) = owner_space(&[2, 3]);
    let left = replica(&owner, 2);
    let right = replica(&owner, 3);
    let id = owner.id();

    let (hub, rl, rr) = (replicator(), replicator(), replicator());
    let h = hub.add_space(owner).await.unwrap();
    let l = rl.add_space(left).await.unwrap();
    let r = rr.add_space(right).await.unwrap();
    connect(&hub, &rl, id).await;
    connect(&hub, &rr, id).await;
    assert_eq!(hub.session_count().await, 2);

    write(&l, doc, "left", 3).await;
    wait_converged(&[&h, &l, &r]).await;
    let value = r.lock().await.document(doc).unwrap().get(&path!["left"]);
    assert_eq!(value, Some(Value::from(2i64)));
}

#[tokio::test]
async fn test_reconnect_resumes_from_durable_frontier() {
    init_logger();
    let (owner, doc) = owner_space(&[2]);
    let member = replica(&owner, 2);
    let id = owner.id();

    let (ra, rb) = (replicator(), replicator());
    let a = ra.add_space(owner).await.unwrap();
    let b = rb.add_space(member).await.unwrap();

    let (ch_a, ch_b) = PeerChannel::pair(64);
    let ha = ra.on_peer_connected(id, ch_a).await.unwrap();
    let hb = rb.on_peer_connected(id, ch_b).await.unwrap();
    write(&a, doc, "before", 2).await;
    wait_converged(&[&a, &b]).await;

    ra.on_peer_disconnected(&ha).await;
    hb.closed().await;
    assert!(rb.sync_states().is_empty());

    write(&a, doc, "after", 4).await;
    write(&b, doc, "offline", 1).await;
    assert!(!converged(&[&a, &b]).await);

    connect(&ra, &rb, id).await;
    wait_converged(&[&a, &b]).await;
    let value = b.lock().await.document(doc).unwrap().get(&path!["after"]);
    assert_eq!(value, Some(Value::from(3i64)));
}

#[tokio::test]
async fn test_sync_state_subscription_sees_progress() {
    let (owner, doc) = owner_space(&[2]);
    let member = replica(&owner, 2);
    let id = owner.id();

    let (ra, rb) = (replicator(), replicator());
    let a = ra.add_space(owner).await.unwrap();
    let b = rb.add_space(member).await.unwrap();
    write(&a, doc, "x", 6).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = ra.subscribe_sync_state(Box::new(move |snapshot| {
        sink.lock().unwrap().push((snapshot.state, snapshot.missing_on_remote));
    }));

    connect(&ra, &rb, id).await;
    wait_converged(&[&a, &b]).await;
    let settled = timeout(Duration::from_secs(5), async {
        loop {
            let states = ra.sync_states();
            if states.len() == 1 && states[0].missing_on_remote == 0 && states[0].state == SessionState::Idle {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok());

    let seen = seen.lock().unwrap().clone();
    assert!(seen.iter().any(|(_, missing)| *missing > 0));
    assert!(seen.iter().any(|(state, _)| *state == SessionState::Streaming));
    assert!(ra.unsubscribe_sync_state(subscription));
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_websocket_client_syncs_with_server() {
    init_logger();
    let (owner, doc) = owner_space(&[2]);
    let member = replica(&owner, 2);
    let id = owner.id();

    let server_side = replicator();
    let a = server_side.add_space(owner).await.unwrap();
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    let server = SyncServer::bind(config, server_side.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let client_side = replicator();
    let b = client_side.add_space(member).await.unwrap();
    write(&a, doc, "server", 3).await;
    write(&b, doc, "client", 3).await;

    let client = SyncClient::start(client_side.clone(), id, format!("ws://{addr}"));
    let connected = timeout(Duration::from_secs(5), client.wait_for(ConnectionState::Connected)).await;
    assert!(connected.is_ok());
    wait_converged(&[&a, &b]).await;
    assert_eq!(
        a.lock().await.document(doc).unwrap().value(),
        b.lock().await.document(doc).unwrap().value()
    );

    client.stop().await;
    assert_eq!(client_side.session_count().await, 0);
}
