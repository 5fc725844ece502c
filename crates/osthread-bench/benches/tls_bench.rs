//! Thread-local key hot paths.
//!
//! `get` is the per-call cost the execution-context manager pays; it must
//! stay a few nanoseconds on either backend.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use osthread::ThreadLocalKey;
use osthread_bench::BenchStats;

fn bench_tls(c: &mut Criterion) {
    let backend = osthread::backend_name();
    let key = ThreadLocalKey::allocate().expect("tls key");
    let mut group = c.benchmark_group("tls");
    group.throughput(Throughput::Elements(1));

    key.set(0xC0FFEE);
    let stats = RefCell::new(BenchStats::default());
    group.bench_function(BenchmarkId::new("get", backend), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                black_box(black_box(key).get());
            }
            let dur = start.elapsed().max(Duration::from_nanos(1));
            stats.borrow_mut().record(iters, dur);
            dur
        });
    });
    stats.borrow().report("get");

    group.bench_function(BenchmarkId::new("set", backend), |b| {
        let mut value = 0usize;
        b.iter(|| {
            value = value.wrapping_add(1);
            black_box(key).set(black_box(value));
        });
    });

    group.bench_function(BenchmarkId::new("attach", backend), |b| {
        b.iter(|| {
            let guard = black_box(key).attach(black_box(7));
            black_box(guard.key());
        });
    });

    key.set(0);
    group.finish();
    key.delete();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(2));
    targets = bench_tls
);
criterion_main!(benches);
