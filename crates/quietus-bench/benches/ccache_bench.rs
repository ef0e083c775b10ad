//! Per-CPU cache fast-path benchmarks.

use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use quietus_core::ccache::{BinBackend, CpuCache, ScriptedCpu};

/// Backend with negligible cost so the numbers isolate the cache paths.
struct CounterBackend {
    next: AtomicUsize,
}

impl BinBackend for CounterBackend {
    fn fill(&self, _class: usize, out: &mut [usize]) -> usize {
        for slot in out.iter_mut() {
            *slot = self.next.fetch_add(8, Ordering::Relaxed);
        }
        out.len()
    }

    fn flush(&self, _class: usize, objs: &[usize]) {
        criterion::black_box(objs);
    }
}

fn bench_hit_path(c: &mut Criterion) {
    let capacities: &[usize] = &[8, 16, 39];
    let mut group = c.benchmark_group("ccache_hit");

    for &cap in capacities {
        group.bench_with_input(BenchmarkId::new("free_then_alloc", cap), &cap, |b, &cap| {
            let cache = CpuCache::new(1, 1, cap);
            let ids = ScriptedCpu::new([0]);
            let backend = CounterBackend {
                next: AtomicUsize::new(0x1000),
            };
            // Half-full steady state: neither path refills nor flushes.
            for i in 0..cap / 2 {
                cache.free(&ids, 0, 0x8000 + i * 8, &backend).expect("seed");
            }
            b.iter(|| {
                let obj = cache.alloc(&ids, 0, &backend).expect("hit");
                cache.free(&ids, 0, criterion::black_box(obj), &backend).expect("return");
            });
        });
    }
    group.finish();
}

fn bench_refill_flush_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ccache_refill_flush");

    group.bench_function("drain_then_fill_cap39", |b| {
        let cap = 39;
        let cache = CpuCache::new(1, 1, cap);
        let ids = ScriptedCpu::new([0]);
        let backend = CounterBackend {
            next: AtomicUsize::new(0x1000),
        };
        b.iter(|| {
            // Empty bin forces a refill, then draining past capacity
            // forces a flush.
            let first = cache.alloc(&ids, 0, &backend).expect("refill");
            for i in 0..cap {
                let _ = cache.free(&ids, 0, 0x100_000 + i * 8, &backend);
            }
            criterion::black_box(first);
            cache.full_flush_unsafe(&backend);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_hit_path, bench_refill_flush_cycle);
criterion_main!(benches);
