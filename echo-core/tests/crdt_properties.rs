//! Property tests for convergence, idempotence and value encoding.
//!
//! Three writers edit one document with partial, ad hoc syncing; afterwards
//! every replica, and a fresh one fed the changes in random order, must hold
//! the identical document.

use echo_core::{
    decode, encode, path, Capability, Change, DocumentId, Identity, ObjKind, SpaceBuilder, SpaceConfig, Space,
    Value,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn identity(n: u8) -> Identity {
    Identity::from_seed([n; 32])
}

fn sync(from: &Space, to: &mut Space) {
    let changes: Vec<Change> = from.changes_since(to.frontier()).cloned().collect();
    for change in changes {
        to.apply_remote(change).unwrap();
    }
}

/// Owner plus two writers, all caught up on one document with a list,
/// a text and a counter.
fn writers() -> (Vec<Space>, DocumentId) {
    let mut a = SpaceBuilder::new(identity(1)).create().unwrap();
    a.admit_member(identity(2).actor(), Capability::Write).unwrap();
    a.admit_member(identity(3).actor(), Capability::Write).unwrap();
    let doc = a.create_document(Some("example.Board")).unwrap().document;
    a.mutate(doc, |tx| {
        tx.make(&path!["items"], ObjKind::List)?;
        tx.make(&path!["body"], ObjKind::Text)?;
        tx.make(&path!["votes"], ObjKind::Counter)
    })
    .unwrap();

    let mut replicas = vec![a];
    for n in [2, 3] {
        let mut r = SpaceBuilder::new(identity(n))
            .join(replicas[0].id(), replicas[0].owner())
            .unwrap();
        sync(&replicas[0], &mut r);
        replicas.push(r);
    }
    (replicas, doc)
}

fn len_of(space: &Space, doc: DocumentId, field: &str) -> usize {
    match space.document(doc).and_then(|d| d.get(&path![field])) {
        Some(Value::List(items)) => items.len(),
        Some(Value::String(s)) => s.chars().count(),
        _ => 0,
    }
}

fn edit(space: &mut Space, doc: DocumentId, kind: u8, value: i64) {
    let items = len_of(space, doc, "items");
    let body = len_of(space, doc, "body");
    let index = value.unsigned_abs() as usize;
    space
        .mutate(doc, |tx| match kind {
            0 => tx.put(&path!["title"], value).map(drop),
            1 => tx.put(&path!["status"], format!("s{}", value % 3)).map(drop),
            2 => tx.insert(&path!["items"], index % (items + 1), value).map(drop),
            3 if items > 0 => tx.delete(&path!["items", index % items]).map(drop),
            4 => tx
                .splice_text(&path!["body"], index % (body + 1), 0, if value % 2 == 0 { "ab" } else { "z" })
                .map(drop),
            5 if body > 0 => tx.splice_text(&path!["body"], index % body, 1, "").map(drop),
            6 => tx.increment(&path!["votes"], value % 10).map(drop),
            _ => tx.delete(&path!["title"]).map(drop),
        })
        .unwrap();
}

fn sync_all(replicas: &mut [Space]) {
    for i in 0..replicas.len() {
        for j in 0..replicas.len() {
            if i != j {
                let (from, to) = if i < j {
                    let (l, r) = replicas.split_at_mut(j);
                    (&l[i], &mut r[0])
                } else {
                    let (l, r) = replicas.split_at_mut(i);
                    (&r[0], &mut l[j])
                };
                sync(from, to);
            }
        }
    }
}

fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1.0e12f64..1.0e12).prop_map(Value::Float),
        "[a-z0-9 ]{0,12}".prop_map(Value::String),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
            proptest::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                .prop_map(|m: BTreeMap<String, Value>| Value::Map(m)),
        ]
    })
}

// ─── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Replicas that saw the same changes hold identical documents,
    /// whatever order the changes arrived in.
    #[test]
    fn replicas_converge(
        edits in proptest::collection::vec((0usize..3, 0u8..8, -50i64..50), 1..40),
        seed in any::<u64>(),
    ) {
        let (mut replicas, doc) = writers();
        for (step, (who, kind, value)) in edits.iter().enumerate() {
            edit(&mut replicas[*who], doc, *kind, *value);
            if step % 7 == 6 {
                let next = (who + 1) % 3;
                let (from, to) = if *who < next {
                    let (l, r) = replicas.split_at_mut(next);
                    (&l[*who], &mut r[0])
                } else {
                    let (l, r) = replicas.split_at_mut(*who);
                    (&r[0], &mut l[next])
                };
                sync(from, to);
            }
        }
        sync_all(&mut replicas);

        let expected = replicas[0].document(doc).cloned();
        prop_assert!(expected.is_some());
        for r in &replicas[1..] {
            prop_assert_eq!(r.document(doc).cloned(), expected.clone());
            prop_assert_eq!(r.frontier(), replicas[0].frontier());
        }

        let mut all: Vec<Change> = replicas[0]
            .changes_since(&Default::default())
            .cloned()
            .collect();
        all.shuffle(&mut StdRng::seed_from_u64(seed));
        let mut fresh = SpaceBuilder::new(identity(9))
            .config(SpaceConfig::default())
            .join(replicas[0].id(), replicas[0].owner())
            .unwrap();
        for change in all {
            fresh.apply_remote(change).unwrap();
        }
        prop_assert_eq!(fresh.log().pending_len(), 0);
        prop_assert_eq!(fresh.document(doc).cloned(), expected);
    }

    /// Delivering every change twice changes nothing.
    #[test]
    fn redelivery_is_idempotent(edits in proptest::collection::vec((0u8..8, -20i64..20), 1..20)) {
        let (mut replicas, doc) = writers();
        for (kind, value) in &edits {
            edit(&mut replicas[1], doc, *kind, *value);
        }
        let changes: Vec<Change> = replicas[1].changes_since(replicas[0].frontier()).cloned().collect();
        for change in changes.iter().chain(changes.iter()) {
            replicas[0].apply_remote(change.clone()).unwrap();
        }
        prop_assert_eq!(replicas[0].document(doc), replicas[1].document(doc));
    }

    /// Decoding an encoding yields the original value, and lazy path reads
    /// agree with full decoding.
    #[test]
    fn codec_roundtrip(value in value_strategy()) {
        let bytes = encode(&value);
        prop_assert_eq!(decode(&bytes).unwrap(), value.clone());
        if let Value::Map(map) = &value {
            let reader = echo_core::ValueReader::new(&bytes).unwrap();
            for (key, expected) in map {
                let field = reader.get(key).unwrap().map(|r| r.decode().unwrap());
                prop_assert_eq!(field.as_ref(), Some(expected));
            }
        }
    }
}
