//! Per-CPU allocation cache.
//!
//! One bin per (CPU, size class). A bin is a fixed array of object slots
//! plus a head index; live objects occupy `[head, capacity)`, so pushes
//! grow downward and `head == capacity` means empty. The head doubles as
//! the bin's ownership word: a sentinel value marks the bin locked while
//! its owner refills or flushes, and every other thread that observes the
//! sentinel takes the arena fallback path instead of waiting.
//!
//! The hardware restartable-sequence protocol is abstracted behind
//! [`CpuIdSource`]: the portable implementation here claims the head word
//! with a CAS, re-reads the CPU id after the claim, and restarts on
//! migration, which gives the same per-CPU exclusivity with ordinary
//! atomics. Refill and flush each move half the capacity at a time so one
//! arena round-trip amortizes over many fast-path operations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Head sentinel: bin locked for refill/flush, peers must fall back.
const LOCKED: usize = usize::MAX;

/// Source of the calling thread's current CPU index.
pub trait CpuIdSource: Send + Sync {
    fn current(&self) -> usize;
}

/// Real CPU ids, clamped to the configured slot count.
pub struct SysCpu {
    ncpus: usize,
}

impl SysCpu {
    #[must_use]
    pub fn new(ncpus: usize) -> Self {
        debug_assert!(ncpus > 0);
        Self { ncpus }
    }
}

impl CpuIdSource for SysCpu {
    #[cfg(target_os = "linux")]
    fn current(&self) -> usize {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 { 0 } else { cpu as usize % self.ncpus }
    }

    #[cfg(not(target_os = "linux"))]
    fn current(&self) -> usize {
        0
    }
}

/// Scripted id sequence for deterministic migration tests. Replays the
/// queued ids in order, then repeats the last one.
pub struct ScriptedCpu {
    seq: Mutex<VecDeque<usize>>,
    last: AtomicUsize,
}

impl ScriptedCpu {
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = usize>) -> Self {
        Self {
            seq: Mutex::new(ids.into_iter().collect()),
            last: AtomicUsize::new(0),
        }
    }
}

impl CpuIdSource for ScriptedCpu {
    fn current(&self) -> usize {
        match self.seq.lock().pop_front() {
            Some(id) => {
                self.last.store(id, Ordering::Relaxed);
                id
            }
            None => self.last.load(Ordering::Relaxed),
        }
    }
}

/// Supplier/consumer of cached objects, implemented by the arena bin
/// layer. Objects are opaque words; the cache never dereferences them.
pub trait BinBackend {
    /// Fills a prefix of `out`, returning how many objects were produced.
    fn fill(&self, class: usize, out: &mut [usize]) -> usize;
    /// Takes back a batch of flushed objects.
    fn flush(&self, class: usize, objs: &[usize]);
}

struct Bin {
    /// Index of the first live slot; `capacity` when empty, [`LOCKED`]
    /// while owned.
    head: AtomicUsize,
    slots: Box<[AtomicUsize]>,
}

impl Bin {
    fn new(capacity: usize) -> Self {
        Self {
            head: AtomicUsize::new(capacity),
            slots: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
        }
    }
}

struct CpuSlot {
    bins: Box<[Bin]>,
    nfills: AtomicU64,
    nflushes: AtomicU64,
}

/// All per-CPU bins for one engine. Sized once at construction.
pub struct CpuCache {
    slots: Box<[CpuSlot]>,
    capacity: usize,
    nclasses: usize,
}

impl CpuCache {
    #[must_use]
    pub fn new(ncpus: usize, nclasses: usize, capacity: usize) -> Self {
        debug_assert!(capacity >= 2);
        let slots = (0..ncpus)
            .map(|_| CpuSlot {
                bins: (0..nclasses).map(|_| Bin::new(capacity)).collect(),
                nfills: AtomicU64::new(0),
                nflushes: AtomicU64::new(0),
            })
            .collect();
        Self {
            slots,
            capacity,
            nclasses,
        }
    }

    #[must_use]
    pub fn handles(&self, class: usize) -> bool {
        class < self.nclasses
    }

    /// Claims exclusive ownership of the calling CPU's bin for `class`.
    /// Returns the bin and the head value observed at claim time, or
    /// `None` when a peer owns the bin (fallback). Restarts on CAS races
    /// and on migration between the id read and the claim.
    fn claim(&self, ids: &dyn CpuIdSource, class: usize) -> Option<(&Bin, usize)> {
        loop {
            let cpu = ids.current();
            let bin = &self.slots[cpu].bins[class];
            let head = bin.head.load(Ordering::Relaxed);
            if head == LOCKED {
                return None;
            }
            if bin
                .head
                .compare_exchange_weak(head, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            // Preempted-and-migrated between the id read and the claim:
            // this is some other CPU's bin. Put it back and restart.
            if ids.current() != cpu {
                bin.head.store(head, Ordering::Release);
                continue;
            }
            return Some((bin, head));
        }
    }

    /// Fast-path allocation. `None` means the caller must take the arena
    /// path: the bin was locked by a peer, or it was empty and the backend
    /// produced nothing.
    pub fn alloc(
        &self,
        ids: &dyn CpuIdSource,
        class: usize,
        backend: &dyn BinBackend,
    ) -> Option<usize> {
        debug_assert!(self.handles(class));
        let (bin, head) = self.claim(ids, class)?;
        if head < self.capacity {
            let obj = bin.slots[head].load(Ordering::Relaxed);
            bin.head.store(head + 1, Ordering::Release);
            return Some(obj);
        }
        // Empty: keep the bin locked and refill it on this thread. The
        // refill may migrate; peers on this CPU see the sentinel and fall
        // back, so exclusivity holds regardless.
        self.refill(bin, ids, class, backend)
    }

    /// Refills half the bin plus the object being returned. Live objects
    /// end up in the top of the array, matching the downward-growth
    /// layout.
    fn refill(
        &self,
        bin: &Bin,
        ids: &dyn CpuIdSource,
        class: usize,
        backend: &dyn BinBackend,
    ) -> Option<usize> {
        let cap = self.capacity;
        let nfill = cap / 2 + 1;
        let mut buf = vec![0usize; nfill];
        let nfilled = backend.fill(class, &mut buf);
        self.slots[ids.current() % self.slots.len()]
            .nfills
            .fetch_add(1, Ordering::Relaxed);
        if nfilled == 0 {
            bin.head.store(cap, Ordering::Release);
            return None;
        }
        let start = cap - nfilled;
        for (slot, obj) in bin.slots[start..].iter().zip(&buf[..nfilled]) {
            slot.store(*obj, Ordering::Relaxed);
        }
        bin.head.store(start + 1, Ordering::Release);
        Some(buf[0])
    }

    /// Fast-path deallocation. `Err(obj)` hands the object back for the
    /// arena path when a peer owns the bin.
    pub fn free(
        &self,
        ids: &dyn CpuIdSource,
        class: usize,
        obj: usize,
        backend: &dyn BinBackend,
    ) -> Result<(), usize> {
        debug_assert!(self.handles(class));
        let Some((bin, head)) = self.claim(ids, class) else {
            return Err(obj);
        };
        if head > 0 {
            bin.slots[head - 1].store(obj, Ordering::Relaxed);
            bin.head.store(head - 1, Ordering::Release);
            return Ok(());
        }
        // Full: flush the newest half, then store the incoming object in
        // the freed space.
        let nflush = self.capacity / 2;
        let batch: Vec<usize> = bin.slots[..nflush]
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect();
        backend.flush(class, &batch);
        self.slots[ids.current() % self.slots.len()]
            .nflushes
            .fetch_add(1, Ordering::Relaxed);
        bin.slots[nflush - 1].store(obj, Ordering::Relaxed);
        bin.head.store(nflush - 1, Ordering::Release);
        Ok(())
    }

    /// Flushes every bin to the backend with no ownership protocol. Only
    /// for teardown and fork recovery, while no other thread runs.
    pub fn full_flush_unsafe(&self, backend: &dyn BinBackend) {
        for slot in self.slots.iter() {
            for (class, bin) in slot.bins.iter().enumerate() {
                let head = bin.head.load(Ordering::Acquire);
                if head == LOCKED {
                    // Owner lost to fork or teardown mid-operation; the
                    // live range is unknowable, discard the contents.
                    bin.head.store(self.capacity, Ordering::Relaxed);
                    continue;
                }
                if head < self.capacity {
                    let batch: Vec<usize> = bin.slots[head..self.capacity]
                        .iter()
                        .map(|s| s.load(Ordering::Relaxed))
                        .collect();
                    backend.flush(class, &batch);
                }
                bin.head.store(self.capacity, Ordering::Relaxed);
            }
        }
    }

    /// Child-side fork recovery: bins caught locked are reset to empty,
    /// everything else is preserved.
    pub fn postfork_child(&self) {
        for slot in self.slots.iter() {
            for bin in slot.bins.iter() {
                if bin.head.load(Ordering::Relaxed) == LOCKED {
                    bin.head.store(self.capacity, Ordering::Relaxed);
                }
            }
        }
    }

    /// Loosely consistent cached-object count across all bins.
    #[must_use]
    pub fn ncached(&self) -> usize {
        self.slots
            .iter()
            .flat_map(|s| s.bins.iter())
            .map(|bin| match bin.head.load(Ordering::Relaxed) {
                LOCKED => 0,
                head => self.capacity - head,
            })
            .sum()
    }

    #[must_use]
    pub fn nfills(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.nfills.load(Ordering::Relaxed))
            .sum()
    }

    #[must_use]
    pub fn nflushes(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.nflushes.load(Ordering::Relaxed))
            .sum()
    }
}
