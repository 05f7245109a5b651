//! Microthread startup cost: spawn a batch of empty microthreads and
//! wait for the runtime to drain them.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use microcsp as csp;

const BATCH: usize = 1000;

fn spawn_batch(c: &mut Criterion) {
    csp::init_runtime(4);

    let mut group = c.benchmark_group("spawn");
    group.throughput(Throughput::Elements(BATCH as u64));
    group.bench_function("empty_batch", |b| {
        b.iter(|| {
            for _ in 0..BATCH {
                csp::spawn(|| {});
            }
            csp::run();
        });
    });
    group.finish();
}

fn spawn_yield_exit(c: &mut Criterion) {
    csp::init_runtime(4);

    let mut group = c.benchmark_group("spawn");
    group.throughput(Throughput::Elements(BATCH as u64));
    group.bench_function("yield_once_batch", |b| {
        b.iter(|| {
            for _ in 0..BATCH {
                csp::spawn(csp::yield_now);
            }
            csp::run();
        });
    });
    group.finish();
}

criterion_group!(benches, spawn_batch, spawn_yield_exit);
criterion_main!(benches);
