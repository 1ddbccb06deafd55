use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use ebs_store::{codec, json_patch, Op, Reconstructor, Repository, StoreConfig};
use serde_json::{json, Value};
use std::time::Duration;

fn task_list(n: usize) -> Value {
    let tasks: Vec<Value> = (0..n)
        .map(|i| json!({"title": format!("task number {i}"), "done": i % 2 == 0, "tags": ["home"]}))
        .collect();
    json!({"data": {"tasks": tasks}})
}

/// Owner with a linear chain of `len` single-task appends; returns the tip.
fn build_chain(repo: &Repository, len: usize) -> u64 {
    let owner = repo.patches.create_owner("bench").unwrap();
    let mut parent = repo
        .patches
        .create_patch(owner.id, owner.head, vec![Op::replace("/data", json!({"tasks": []}))], None)
        .unwrap()
        .id;
    for i in 0..len {
        let ops = vec![Op::add("/data/tasks/-", json!({"title": format!("task {i}")}))];
        parent = repo.patches.create_patch(owner.id, parent, ops, None).unwrap().id;
    }
    parent
}

fn bench_codec_encode_document(c: &mut Criterion) {
    let doc = task_list(200);
    c.bench_function("codec_encode_200_tasks", |b| {
        b.iter(|| black_box(codec::encode_json(black_box(&doc)).unwrap()))
    });
}

fn bench_codec_decode_document(c: &mut Criterion) {
    let encoded = codec::encode_json(&task_list(200)).unwrap();
    c.bench_function("codec_decode_200_tasks", |b| {
        b.iter(|| black_box(codec::decode_json::<Value>(black_box(&encoded)).unwrap()))
    });
}

fn bench_apply_patch(c: &mut Criterion) {
    let base = task_list(200);
    let ops = vec![
        Op::add("/data/tasks/-", json!({"title": "new"})),
        Op::replace("/data/tasks/0/done", json!(true)),
        Op::remove("/data/tasks/1"),
    ];
    c.bench_function("json_patch_apply_3_ops", |b| {
        b.iter(|| {
            let mut doc = base.clone();
            json_patch::apply(&mut doc, black_box(&ops)).unwrap();
            black_box(doc);
        })
    });
}

fn bench_reconstruct_chain_1000(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let tip = build_chain(&repo, 1000);
    // Never write back, so every iteration replays the full chain
    let cold = Reconstructor::with_threshold(repo.store().clone(), Duration::MAX);

    c.bench_function("reconstruct_chain_1000", |b| {
        b.iter(|| black_box(cold.get_data(black_box(tip)).unwrap()))
    });
}

fn bench_reconstruct_from_snapshot(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let tip = build_chain(&repo, 1000);
    Reconstructor::with_threshold(repo.store().clone(), Duration::ZERO)
        .reconstruct(tip)
        .unwrap();

    c.bench_function("reconstruct_from_snapshot_1000", |b| {
        b.iter(|| black_box(repo.reconstructor.get_data(black_box(tip)).unwrap()))
    });
}

fn bench_create_patch(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let owner = repo.patches.create_owner("bench").unwrap();
    repo.queue.create_client(owner.id, "phone").unwrap();

    c.bench_function("create_patch_with_fan_out", |b| {
        b.iter(|| {
            let ops = vec![Op::replace("/data", json!("x"))];
            black_box(repo.patches.create_patch(owner.id, owner.head, ops, None).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_codec_encode_document,
    bench_codec_decode_document,
    bench_apply_patch,
    bench_reconstruct_chain_1000,
    bench_reconstruct_from_snapshot,
    bench_create_patch,
);
criterion_main!(benches);
