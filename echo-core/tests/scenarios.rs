//! End-to-end scenarios across replicas of one space.

use echo_core::op::{Action, ObjId};
use echo_core::{
    path, AppendError, AppendOutcome, Capability, Change, ChangeBuilder, DocumentId, Frontier, Identity, OpId,
    Operation, Space, SpaceBuilder, SpaceConfig, SpaceError, Value,
};
use std::collections::BTreeSet;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn identity(n: u8) -> Identity {
    Identity::from_seed([n; 32])
}

fn join(of: &Space, n: u8) -> Space {
    SpaceBuilder::new(identity(n)).join(of.id(), of.owner()).unwrap()
}

fn sync(from: &Space, to: &mut Space) {
    let changes: Vec<Change> = from.changes_since(to.frontier()).cloned().collect();
    for change in changes {
        to.apply_remote(change).unwrap();
    }
}

fn changes_of(space: &Space, actor: &echo_core::ActorId) -> Vec<Change> {
    let head = space.log().head(actor).map_or(0, |(seq, _)| seq);
    space.log().range(actor, 1, head).to_vec()
}

/// A forged change by `author` that writes `title` without asking its space.
fn forged_write(author: &Identity, prev: &Change, deps: Frontier, doc: DocumentId, lamport: u64) -> Change {
    let next_op = prev.ops.last().map_or(1, |op| op.id.seq + 1);
    let op = Operation {
        id: OpId::new(author.actor(), next_op),
        lamport,
        deps: BTreeSet::new(),
        document: doc,
        action: Action::Put {
            obj: ObjId::Root,
            key: "title".into(),
            value: Value::from("sneaky"),
        },
    };
    ChangeBuilder::new(prev.seq + 1)
        .prev(Some(prev.hash().unwrap()))
        .deps(deps)
        .op(op)
        .sign(author)
        .unwrap()
}

// ─── Concurrent writes ───────────────────────────────────────────────────────

#[test]
fn test_concurrent_title_resolves_by_actor() {
    init_logger();
    let mut a = SpaceBuilder::new(identity(1)).create().unwrap();
    a.admit_member(identity(2).actor(), Capability::Write).unwrap();
    let doc = a.create_document(None).unwrap().document;
    let mut b = join(&a, 2);
    sync(&a, &mut b);

    // Same causal parent, neither has seen the other.
    a.local_mutate(doc, &path!["title"], "draft").unwrap();
    b.local_mutate(doc, &path!["title"], "final").unwrap();

    let winner = if identity(1).actor() > identity(2).actor() {
        "draft"
    } else {
        "final"
    };

    let mut c1 = join(&a, 3);
    sync(&a, &mut c1);
    sync(&b, &mut c1);
    let mut c2 = join(&a, 4);
    sync(&b, &mut c2);
    sync(&a, &mut c2);
    sync(&b, &mut a);
    sync(&a, &mut b);

    for replica in [&a, &b, &c1, &c2] {
        let d = replica.document(doc).unwrap();
        assert_eq!(d.get(&path!["title"]), Some(Value::from(winner)));
        assert_eq!(d.conflicts(&path!["title"]).len(), 2);
    }
    assert_eq!(c1.document(doc), c2.document(doc));
}

// ─── Out-of-order delivery ───────────────────────────────────────────────────

#[test]
fn test_out_of_order_changes_are_buffered() {
    init_logger();
    let mut a = SpaceBuilder::new(identity(1)).create().unwrap();
    let doc = a.create_document(None).unwrap().document;
    a.local_mutate(doc, &path!["n"], 1i64).unwrap();
    let chain = changes_of(&a, &identity(1).actor());
    assert_eq!(chain.len(), 3);

    let mut r = join(&a, 2);
    let report = r.apply_remote(chain[2].clone()).unwrap();
    assert_eq!(report.outcome, AppendOutcome::Pending);
    assert!(report.committed.is_empty());
    assert_eq!(r.log().pending_len(), 1);

    let report = r.apply_remote(chain[0].clone()).unwrap();
    assert_eq!(report.outcome, AppendOutcome::Committed);
    assert_eq!(report.committed.len(), 1);

    let report = r.apply_remote(chain[1].clone()).unwrap();
    assert_eq!(report.committed, vec![chain[1].hash().unwrap(), chain[2].hash().unwrap()]);
    assert_eq!(r.log().pending_len(), 0);
    assert_eq!(r.frontier(), a.frontier());
    assert_eq!(r.document(doc).unwrap().get(&path!["n"]), Some(Value::Int(1)));
}

#[test]
fn test_pending_overflow_requests_resync() {
    init_logger();
    let mut a = SpaceBuilder::new(identity(1)).create().unwrap();
    let doc = a.create_document(None).unwrap().document;
    for i in 0..12 {
        a.local_mutate(doc, &path!["n"], i as i64).unwrap();
    }
    let chain = changes_of(&a, &identity(1).actor());

    let mut r = SpaceBuilder::new(identity(2))
        .config(SpaceConfig::for_testing())
        .join(a.id(), a.owner())
        .unwrap();
    let mut overflowed = false;
    for change in chain.iter().skip(1) {
        match r.apply_remote(change.clone()) {
            Ok(_) => {}
            Err(SpaceError::Append(AppendError::PendingBufferExhausted { .. })) => {
                overflowed = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(overflowed);

    // A resync from scratch still converges.
    assert!(r.clear_pending(&identity(1).actor()) > 0);
    sync(&a, &mut r);
    assert_eq!(r.frontier(), a.frontier());
}

#[test]
fn test_tampered_change_rejected() {
    init_logger();
    let mut a = SpaceBuilder::new(identity(1)).create().unwrap();
    a.create_document(None).unwrap();
    let mut chain = changes_of(&a, &identity(1).actor());
    chain[1].timestamp += 1;

    let mut r = join(&a, 2);
    r.apply_remote(chain[0].clone()).unwrap();
    let err = r.apply_remote(chain[1].clone()).unwrap_err();
    assert!(matches!(err, SpaceError::Append(AppendError::SignatureInvalid { .. })));
    assert_eq!(r.frontier().get(&identity(1).actor()), 1);
}

// ─── Capabilities ────────────────────────────────────────────────────────────

#[test]
fn test_revocation_applies_causally() {
    init_logger();
    let owner = identity(1);
    let writer = identity(2);
    let mut a = SpaceBuilder::new(owner.clone()).create().unwrap();
    a.admit_member(writer.actor(), Capability::Write).unwrap();
    let doc = a.create_document(None).unwrap().document;

    let mut b = join(&a, 2);
    sync(&a, &mut b);
    b.local_mutate(doc, &path!["title"], "b1").unwrap();
    let before_revoke = b.frontier().clone();
    sync(&b, &mut a);

    a.revoke_member(writer.actor()).unwrap();
    let b1 = changes_of(&b, &writer.actor()).pop().unwrap();

    // b2 was written after seeing the revocation: refused everywhere.
    let after_revoke = a.frontier().clone();
    let b2 = forged_write(&writer, &b1, after_revoke, doc, 100);
    let mut c = join(&a, 3);
    sync(&a, &mut c);
    let err = c.apply_remote(b2.clone()).unwrap_err();
    assert!(err.is_forbidden());
    assert!(a.apply_remote(b2).unwrap_err().is_forbidden());
    assert_eq!(a.document(doc).unwrap().get(&path!["title"]), Some(Value::from("b1")));

    // A change concurrent with the revocation is still valid.
    let concurrent = forged_write(&writer, &b1, before_revoke, doc, 100);
    let mut d = join(&a, 4);
    sync(&a, &mut d);
    let report = d.apply_remote(concurrent).unwrap();
    assert_eq!(report.outcome, AppendOutcome::Committed);
    assert_eq!(d.document(doc).unwrap().get(&path!["title"]), Some(Value::from("sneaky")));
}

#[test]
fn test_reader_cannot_write() {
    let mut a = SpaceBuilder::new(identity(1)).create().unwrap();
    a.admit_member(identity(2).actor(), Capability::Read).unwrap();
    let mut b = join(&a, 2);
    sync(&a, &mut b);
    assert!(matches!(
        b.create_document(None),
        Err(SpaceError::NotAuthorized { .. })
    ));
}

#[test]
fn test_deleted_document_stays_deleted() {
    let mut a = SpaceBuilder::new(identity(1)).create().unwrap();
    let doc = a.create_document(None).unwrap().document;
    a.delete_document(doc).unwrap();
    let mut b = join(&a, 2);
    sync(&a, &mut b);
    let d = b.document(doc).unwrap();
    assert!(d.is_deleted());
    assert!(!b.document_ids().contains(&doc));
    assert_eq!(a.document_digests(), b.document_digests());
}
