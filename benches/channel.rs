//! Rendezvous and selective-wait benchmarks.
//!
//! Measures the channel hot paths with the runtime in M:N mode: the
//! two-party ping-pong round trip and an `alt` spread over several
//! channels with one ready peer.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use microcsp as csp;

const ROUNDS: u64 = 1000;

fn ping_pong(c: &mut Criterion) {
    csp::init_runtime(2);

    let mut group = c.benchmark_group("channel");
    group.throughput(Throughput::Elements(ROUNDS));
    group.bench_function("ping_pong", |b| {
        b.iter(|| {
            let (ping_w, ping_r) = csp::channel::<u64>();
            let (pong_w, pong_r) = csp::channel::<u64>();
            csp::spawn(move || {
                for v in ping_r.iter() {
                    if pong_w.send(v).is_err() {
                        return;
                    }
                }
            });
            for i in 0..ROUNDS {
                ping_w.send(i).unwrap();
                assert_eq!(pong_r.recv().unwrap(), i);
            }
            drop(ping_w);
        });
    });
    group.finish();
}

fn alt_one_ready(c: &mut Criterion) {
    csp::init_runtime(2);

    let mut group = c.benchmark_group("alt");
    group.throughput(Throughput::Elements(ROUNDS));
    group.bench_function("four_arms_one_ready", |b| {
        b.iter(|| {
            let idle: Vec<_> = (0..3).map(|_| csp::channel::<u64>()).collect();
            let (w, r) = csp::channel::<u64>();
            csp::spawn(move || {
                for i in 0..ROUNDS {
                    if w.send(i).is_err() {
                        return;
                    }
                }
            });
            for _ in 0..ROUNDS {
                let mut slots = [None, None, None, None];
                let [s0, s1, s2, s3] = &mut slots;
                let sig = csp::alt(&[
                    idle[0].1.recv_op(s0),
                    idle[1].1.recv_op(s1),
                    idle[2].1.recv_op(s2),
                    r.recv_op(s3),
                ]);
                assert_eq!(sig, csp::Signal::Ready(3));
            }
            drop(r);
        });
    });
    group.finish();
}

criterion_group!(benches, ping_pong, alt_one_ready);
criterion_main!(benches);
