//! Benchmarks for weft pool throughput.
//!
//! Run with: cargo bench

use std::sync::atomic::{AtomicIsize, Ordering};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft_rs::{Next, WeftBuilder, WorkHandle, WorkItem};

struct Countdown {
    remaining: AtomicIsize,
}

impl WorkItem for Countdown {
    fn next(&self) -> Next {
        let ret = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if ret <= 0 {
            Next::Retire
        } else {
            Next::Ready(ret)
        }
    }

    fn run(&self, work: isize) -> weft_rs::Result<()> {
        criterion::black_box(work);
        Ok(())
    }
}

/// Submit a batch of counted items and wait for natural completion.
fn bench_submit_wait(c: &mut Criterion) {
    let pool = WeftBuilder::new()
        .prefix("bench")
        .idle_timeout_ms(60_000)
        .build()
        .unwrap();

    let mut group_bench = c.benchmark_group("submit_wait");
    for items in [1usize, 16, 256] {
        group_bench.throughput(Throughput::Elements(items as u64));
        group_bench.bench_with_input(BenchmarkId::from_parameter(items), &items, |b, &items| {
            b.iter(|| {
                let group = pool.make_group().unwrap();
                let handles: Vec<WorkHandle> = (0..items)
                    .map(|_| {
                        WorkHandle::new(Countdown {
                            remaining: AtomicIsize::new(4),
                        })
                    })
                    .collect();
                group.submit(&handles).unwrap();
                group.wait().unwrap();
            });
        });
    }
    group_bench.finish();

    pool.shutdown();
}

/// One long-lived item churning through many work values: measures the
/// per-dispatch overhead of the next/run cycle.
fn bench_dispatch_cycle(c: &mut Criterion) {
    let pool = WeftBuilder::new()
        .prefix("benchcycle")
        .max_workers(1)
        .idle_timeout_ms(60_000)
        .build()
        .unwrap();

    c.bench_function("dispatch_cycle_1000", |b| {
        b.iter(|| {
            let group = pool.make_group().unwrap();
            let item = WorkHandle::new(Countdown {
                remaining: AtomicIsize::new(1000),
            });
            group.submit(std::slice::from_ref(&item)).unwrap();
            group.wait().unwrap();
        });
    });

    pool.shutdown();
}

criterion_group!(benches, bench_submit_wait, bench_dispatch_cycle);
criterion_main!(benches);
