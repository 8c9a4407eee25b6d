use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use textsync::protocol::Message;
use textsync::{ot, Component, Op};

fn typing_burst(base: usize, n: usize) -> Op {
    // a realistic editing run: short inserts marching right, spaced so
    // they stay separate components
    let mut op = Vec::new();
    for i in 0..n {
        ot::append(&mut op, Component::insert(base + i * 3, "ab"));
    }
    op
}

fn bench_apply(c: &mut Criterion) {
    let snapshot = "the quick brown fox jumps over the lazy dog ".repeat(100);
    let op = typing_burst(10, 50);

    c.bench_function("apply_50_inserts_4KB", |b| {
        b.iter(|| {
            black_box(ot::apply(black_box(&snapshot), black_box(&op)).unwrap());
        })
    });
}

fn bench_compose(c: &mut Criterion) {
    let op1 = typing_burst(0, 50);
    let op2 = typing_burst(25, 50);

    c.bench_function("compose_50x50", |b| {
        b.iter(|| {
            black_box(ot::compose(black_box(&op1), black_box(&op2)));
        })
    });
}

fn bench_transform_x(c: &mut Criterion) {
    let left = typing_burst(0, 20);
    let mut right = Vec::new();
    for i in 0..20 {
        ot::append(&mut right, Component::delete(i * 3, "x"));
    }
    // the deletes must exist in whatever document these apply to; for the
    // transform itself only the shapes matter

    c.bench_function("transform_x_20x20", |b| {
        b.iter(|| {
            black_box(ot::transform_x(black_box(&left), black_box(&right)).unwrap());
        })
    });
}

fn bench_invert(c: &mut Criterion) {
    let op = typing_burst(0, 100);

    c.bench_function("invert_100", |b| {
        b.iter(|| {
            black_box(ot::invert(black_box(&op)));
        })
    });
}

fn bench_message_encode(c: &mut Criterion) {
    let msg = Message::remote_op("notes", typing_burst(0, 10), 42);

    c.bench_function("message_encode_10_components", |b| {
        b.iter(|| {
            black_box(serde_json::to_vec(black_box(&msg)).unwrap());
        })
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let msg = Message::remote_op("notes", typing_burst(0, 10), 42);
    let encoded = serde_json::to_vec(&msg).unwrap();

    c.bench_function("message_decode_10_components", |b| {
        b.iter(|| {
            black_box(serde_json::from_slice::<Message>(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_model_commit_chain(c: &mut Criterion) {
    use textsync::{DocModel, SubmittedOp};
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("model_100_sequential_commits", |b| {
        b.iter(|| {
            rt.block_on(async {
                let model = DocModel::with_defaults();
                model.create("d", "").await.unwrap();
                for i in 0..100u64 {
                    model
                        .apply_op(
                            "d",
                            SubmittedOp {
                                op: vec![Component::insert(i as usize, "x")],
                                version: i,
                                source: 1,
                            },
                        )
                        .await
                        .unwrap();
                }
            });
        })
    });
}

criterion_group!(
    benches,
    bench_apply,
    bench_compose,
    bench_transform_x,
    bench_invert,
    bench_message_encode,
    bench_message_decode,
    bench_model_commit_chain,
);
criterion_main!(benches);
