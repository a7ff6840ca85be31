use criterion::{black_box, criterion_group, criterion_main, Criterion};
use echo_core::{
    decode, encode, path, Change, Identity, ObjKind, Space, SpaceBuilder, SpaceConfig, Value, ValueReader,
};
use std::collections::BTreeMap;

fn sample_value() -> Value {
    let mut task = BTreeMap::new();
    task.insert("title".to_string(), Value::from("Write the quarterly report"));
    task.insert("done".to_string(), Value::Bool(false));
    task.insert("estimate".to_string(), Value::Float(3.5));
    task.insert(
        "tags".to_string(),
        Value::List(vec![Value::from("work"), Value::from("q3"), Value::from("writing")]),
    );
    let tasks = (0..32).map(|_| Value::Map(task.clone())).collect();
    let mut root = BTreeMap::new();
    root.insert("name".to_string(), Value::from("board"));
    root.insert("tasks".to_string(), Value::List(tasks));
    Value::Map(root)
}

fn bench_codec(c: &mut Criterion) {
    let value = sample_value();
    let bytes = encode(&value);

    c.bench_function("codec_encode_board", |b| b.iter(|| black_box(encode(black_box(&value)))));
    c.bench_function("codec_decode_board", |b| {
        b.iter(|| black_box(decode(black_box(&bytes)).unwrap()))
    });
    c.bench_function("codec_lazy_path_read", |b| {
        b.iter(|| {
            let reader = ValueReader::new(black_box(&bytes)).unwrap();
            black_box(reader.path(&path!["tasks", 31usize, "title"]).unwrap());
        })
    });
}

fn writer() -> Space {
    SpaceBuilder::new(Identity::from_seed([1; 32]))
        .config(SpaceConfig {
            snapshot_interval: 0,
            ..SpaceConfig::default()
        })
        .create()
        .unwrap()
}

fn bench_local_edits(c: &mut Criterion) {
    c.bench_function("space_put_100", |b| {
        b.iter(|| {
            let mut space = writer();
            let doc = space.create_document(None).unwrap().document;
            for i in 0..100i64 {
                space.local_mutate(doc, &path!["n"], i).unwrap();
            }
            black_box(space.frontier().total());
        })
    });

    c.bench_function("text_typing_200_chars", |b| {
        b.iter(|| {
            let mut space = writer();
            let doc = space.create_document(None).unwrap().document;
            space.mutate(doc, |tx| tx.make(&path!["body"], ObjKind::Text)).unwrap();
            space
                .mutate(doc, |tx| {
                    for i in 0..200 {
                        tx.splice_text(&path!["body"], i, 0, "x")?;
                    }
                    Ok(())
                })
                .unwrap();
            black_box(space.document(doc).unwrap().get(&path!["body"]));
        })
    });
}

fn bench_remote_apply(c: &mut Criterion) {
    let mut source = writer();
    let doc = source.create_document(None).unwrap().document;
    for i in 0..200i64 {
        source.local_mutate(doc, &path!["n"], i).unwrap();
    }
    let changes: Vec<Change> = source.changes_since(&Default::default()).cloned().collect();
    let mut reversed = changes.clone();
    reversed.reverse();

    c.bench_function("apply_remote_200_in_order", |b| {
        b.iter(|| {
            let mut replica = SpaceBuilder::new(Identity::from_seed([2; 32]))
                .join(source.id(), source.owner())
                .unwrap();
            for change in &changes {
                replica.apply_remote(change.clone()).unwrap();
            }
            black_box(replica.frontier().total());
        })
    });

    c.bench_function("apply_remote_200_reversed", |b| {
        b.iter(|| {
            let mut replica = SpaceBuilder::new(Identity::from_seed([2; 32]))
                .join(source.id(), source.owner())
                .unwrap();
            for change in &reversed {
                replica.apply_remote(change.clone()).unwrap();
            }
            black_box(replica.frontier().total());
        })
    });
}

criterion_group!(benches, bench_codec, bench_local_edits, bench_remote_apply);
criterion_main!(benches);
