//! Batcher handoff benchmarks.

use std::sync::Arc;
use std::thread;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use quietus_core::Batcher;

fn bench_push_pop_cycle(c: &mut Criterion) {
    let capacities: &[usize] = &[4, 8, 16, 32];
    let mut group = c.benchmark_group("batcher_push_pop");

    for &cap in capacities {
        group.bench_with_input(BenchmarkId::new("uncontended", cap), &cap, |b, &cap| {
            let batcher = Batcher::<usize>::new(cap);
            b.iter(|| {
                for i in 0..cap {
                    batcher.try_push(i).expect("push");
                }
                let batch = batcher.pop_begin().expect("nonempty");
                criterion::black_box(batch.count());
            });
        });
    }
    group.finish();
}

fn bench_contended_pushers(c: &mut Criterion) {
    let mut group = c.benchmark_group("batcher_contended");
    group.sample_size(20);

    group.bench_function("4_pushers_1_popper", |b| {
        b.iter(|| {
            let batcher = Arc::new(Batcher::<usize>::new(32));
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let batcher = Arc::clone(&batcher);
                    thread::spawn(move || {
                        for i in 0..250usize {
                            let mut v = t * 1000 + i;
                            while let Err(back) = batcher.try_push(v) {
                                v = back;
                                thread::yield_now();
                            }
                        }
                    })
                })
                .collect();
            let mut popped = 0usize;
            while popped < 1000 {
                if let Some(batch) = batcher.pop_begin() {
                    popped += batch.count();
                }
            }
            for handle in handles {
                handle.join().expect("pusher");
            }
            criterion::black_box(popped);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_push_pop_cycle, bench_contended_pushers);
criterion_main!(benches);
