use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use clilogger::protocol::{decode, Entity, Severity};

fn make_entity(message_len: usize) -> Entity {
    Entity::new("x".repeat(message_len), Severity::Info, 100).with_location(
        Some("Sources/App/NetworkClient.swift".into()),
        Some(128),
        Some("send(_:)".into()),
    )
}

fn bench_encode_entity(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_entity");

    for message_len in [16, 256, 4096].iter() {
        let entity = make_entity(*message_len);
        group.bench_with_input(
            BenchmarkId::from_parameter(message_len),
            &entity,
            |b, entity| b.iter(|| black_box(entity.encode().unwrap())),
        );
    }

    group.finish();
}

fn bench_decode_entity(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_entity");

    for message_len in [16, 256, 4096].iter() {
        let wire = make_entity(*message_len).encode().unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(message_len),
            &wire,
            |b, wire| {
                b.iter(|| {
                    let frame = decode(black_box(wire)).unwrap();
                    black_box(Entity::decode(&frame.payload).unwrap())
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_encode_entity, bench_decode_entity);
criterion_main!(benches);
