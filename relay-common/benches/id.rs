use criterion::{criterion_group, criterion_main, Criterion};
use relay_common::ConnIdGenerator;

fn bench_next_id(c: &mut Criterion) {
    let gen = ConnIdGenerator::new();
    c.bench_function("next_id", |b| {
        b.iter(|| gen.next_id().unwrap());
    });
}

criterion_group!(benches, bench_next_id);
criterion_main!(benches);
