//! Per-CPU cache under real thread preemption and migration: objects are
//! never duplicated and never lost, whatever interleaving of fast paths,
//! refills, flushes, and peer fallbacks the scheduler produces.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use parking_lot::Mutex;
use quietus_core::ccache::{BinBackend, CpuCache, CpuIdSource, SysCpu};

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 5_000;
const CLASSES: usize = 4;
const BIN_CAPACITY: usize = 8;

/// Hands out globally unique object words and checks that nothing comes
/// back twice. A double flush of the same word means the cache duplicated
/// an object; that is exactly the migration-atomicity failure mode.
struct LedgerBackend {
    next: AtomicUsize,
    handed_out: AtomicUsize,
    returned: Mutex<HashSet<usize>>,
}

impl LedgerBackend {
    fn new() -> Self {
        Self {
            next: AtomicUsize::new(1),
            handed_out: AtomicUsize::new(0),
            returned: Mutex::new(HashSet::new()),
        }
    }
}

impl BinBackend for LedgerBackend {
    fn fill(&self, _class: usize, out: &mut [usize]) -> usize {
        for slot in out.iter_mut() {
            *slot = self.next.fetch_add(1, Ordering::Relaxed);
        }
        self.handed_out.fetch_add(out.len(), Ordering::Relaxed);
        out.len()
    }

    fn flush(&self, _class: usize, objs: &[usize]) {
        let mut returned = self.returned.lock();
        for &obj in objs {
            assert!(obj != 0, "uninitialized slot flushed");
            assert!(returned.insert(obj), "object {obj:#x} flushed twice");
        }
    }
}

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed | 1 }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

#[test]
fn threaded_churn_conserves_objects() {
    let ncpus = thread::available_parallelism().map_or(1, |n| n.get());
    let cache = Arc::new(CpuCache::new(ncpus, CLASSES, BIN_CAPACITY));
    let backend = Arc::new(LedgerBackend::new());
    let ids = Arc::new(SysCpu::new(ncpus));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let backend = Arc::clone(&backend);
            let ids = Arc::clone(&ids);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = XorShift64::new(t as u64 + 0x9E37);
                let mut held: Vec<(usize, usize)> = Vec::new();
                barrier.wait();
                for _ in 0..OPS_PER_THREAD {
                    let class = (rng.next_u64() as usize) % CLASSES;
                    if rng.next_u64() & 1 == 0 || held.is_empty() {
                        if let Some(obj) = cache.alloc(ids.as_ref(), class, backend.as_ref()) {
                            held.push((class, obj));
                        }
                    } else {
                        let pick = (rng.next_u64() as usize) % held.len();
                        let (class, obj) = held.swap_remove(pick);
                        if let Err(back) = cache.free(ids.as_ref(), class, obj, backend.as_ref()) {
                            // Peer owned the bin; return straight to the
                            // backend, as an arena-path free would.
                            backend.flush(class, &[back]);
                        }
                    }
                }
                for (class, obj) in held {
                    if let Err(back) = cache.free(ids.as_ref(), class, obj, backend.as_ref()) {
                        backend.flush(class, &[back]);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker");
    }

    // Quiescent now; drain the bins. The flush asserts catch duplicates.
    cache.full_flush_unsafe(backend.as_ref());
    assert_eq!(cache.ncached(), 0);

    // Every object the backend produced came back exactly once.
    let handed = backend.handed_out.load(Ordering::Relaxed);
    assert_eq!(backend.returned.lock().len(), handed);
}

#[test]
fn single_cpu_contention_uses_fallback_not_blocking() {
    // Pin everything to one logical slot so every thread fights over the
    // same bins. Claims lost to a peer must fall back, not deadlock.
    let cache = Arc::new(CpuCache::new(1, 1, BIN_CAPACITY));
    let backend = Arc::new(LedgerBackend::new());
    let ids = Arc::new(SysCpu::new(1));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let backend = Arc::clone(&backend);
            let ids = Arc::clone(&ids);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..OPS_PER_THREAD {
                    if let Some(obj) = cache.alloc(ids.as_ref(), 0, backend.as_ref()) {
                        if let Err(back) = cache.free(ids.as_ref(), 0, obj, backend.as_ref()) {
                            backend.flush(0, &[back]);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker");
    }

    cache.full_flush_unsafe(backend.as_ref());
    let handed = backend.handed_out.load(Ordering::Relaxed);
    assert_eq!(backend.returned.lock().len(), handed);
}

#[test]
fn cpu_ids_stay_in_range() {
    let ids = SysCpu::new(2);
    for _ in 0..64 {
        assert!(ids.current() < 2);
    }
}
