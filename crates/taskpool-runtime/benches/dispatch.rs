//! Hot-path benchmarks: slot acquisition and handoff round trips.

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{criterion_group, criterion_main, Criterion};
use taskpool_core::cancel::CancellationToken;
use taskpool_runtime::{Handoff, TaskPool, TaskPoolOptions};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    let pool = TaskPool::new(
        |_| {},
        TaskPoolOptions::new().max_active_workers(4).name("bench"),
    )
    .unwrap();

    group.bench_function("try_next_drop", |b| {
        b.iter(|| drop(black_box(pool.try_next())));
    });

    group.bench_function("next_drop", |b| {
        b.iter(|| drop(black_box(pool.next())));
    });

    let handled = AtomicU64::new(0);
    let handoff = Handoff::new(
        || Some(1u64),
        move |n| {
            handled.fetch_add(n, Ordering::Relaxed);
        },
        1024,
    );
    let token = CancellationToken::never();

    group.bench_function("handoff_listen_handle", |b| {
        b.iter(|| {
            black_box(handoff.listen());
            black_box(handoff.handle(&token));
        });
    });

    group.finish();
}
