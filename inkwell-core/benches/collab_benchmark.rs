use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use inkwell_core::{codec, ActorId, Color, Document, LocalOp, Point, Rect, Shape, Update};
use std::hint::black_box;

fn create_test_shape(n: usize) -> Shape {
    Shape::rect(format!("r{n}"), Color::default(), Rect::new(10.0, 10.0, 50.0, 50.0))
}

fn long_stroke() -> Update {
    let points = (0..10_000).map(|i| Point::new(i as f32, i as f32)).collect();
    let mut doc = Document::new(ActorId::from("bench"));
    doc.apply_local(LocalOp::Push(Shape::stroke("s", Color::default(), points)))
}

fn bench_local_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push_local", |b| {
        // measures appending to an ever-growing document
        let mut doc = Document::new(ActorId::from("bench"));
        let mut n = 0;
        b.iter(|| {
            n += 1;
            let update = doc.apply_local(LocalOp::Push(black_box(create_test_shape(n))));
            black_box(update);
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document");

    let mut source = Document::new(ActorId::from("source"));
    let updates: Vec<Update> = (0..1_000)
        .map(|n| source.apply_local(LocalOp::InsertAt(n / 2, create_test_shape(n))))
        .collect();
    group.throughput(Throughput::Elements(updates.len() as u64));

    group.bench_function("apply_remote_1000", |b| {
        b.iter(|| {
            let mut dest = Document::new(ActorId::from("dest"));
            for update in &updates {
                dest.apply_remote(black_box(update));
            }
            black_box(dest.len());
        })
    });

    group.bench_function("apply_remote_duplicate", |b| {
        let mut dest = Document::new(ActorId::from("dest"));
        dest.apply_remote(&updates[0]);
        b.iter(|| {
            black_box(dest.apply_remote(black_box(&updates[0])));
        })
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("Codec");
    let update = long_stroke();
    let bytes = codec::encode(&update);
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("encode_10k_point_stroke", |b| {
        b.iter(|| black_box(codec::encode(black_box(&update))))
    });
    group.bench_function("decode_10k_point_stroke", |b| {
        b.iter(|| black_box(codec::decode(black_box(&bytes))))
    });

    group.finish();
}

criterion_group!(benches, bench_local_insert, bench_apply_remote, bench_codec);
criterion_main!(benches);
