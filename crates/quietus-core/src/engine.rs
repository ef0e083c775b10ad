//! Process-wide engine context.
//!
//! [`Engine`] owns the arenas, the background worker pool, the per-CPU
//! cache, and one deferred-release batcher per arena, and exposes the
//! public operation surface: extent acquire/release, decay ticks,
//! background-thread control, the allocation fast path, and the fork
//! protocol.
//!
//! Threads are spread over an engine's arenas round-robin on first use;
//! the binding is sticky per (thread, engine) pair. Releases from a
//! thread bound to
//! a different arena than the extent's owner go through that arena's
//! batcher instead of its locks, and get drained on the next decay pass
//! over the owner.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use crate::arena::{Arena, DecayTier, ExtentLease};
use crate::batcher::{BATCHER_MAX_ELEMS, Batcher};
use crate::background::{BackgroundStats, BackgroundThreads};
use crate::ccache::{BinBackend, CpuCache, CpuIdSource, SysCpu};
use crate::config::EngineConfig;
use crate::error::{InitError, MapError};
use crate::pages::{PageOps, SystemPages};
use crate::stats::{EngineStats, StatsSnapshot};

/// Monotonic nanosecond clock shared by decay state and workers. Using
/// one origin keeps every deadline in the same timeline.
pub struct Clock {
    origin: Instant,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    #[must_use]
    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// An extent handed out by the engine, tagged with its owning arena so
/// it can be released from any thread.
#[derive(Clone, Copy, Debug)]
pub struct Lease {
    pub arena_ind: u32,
    pub inner: ExtentLease,
}

impl Lease {
    #[must_use]
    pub fn base(&self) -> usize {
        self.inner.base
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    #[must_use]
    pub fn zeroed(&self) -> bool {
        self.inner.zeroed
    }
}

thread_local! {
    /// (engine identity, arena index). The identity is the engine's
    /// address, so a binding never leaks across engine instances.
    static THREAD_ARENA: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

pub struct Engine {
    config: EngineConfig,
    stats: Arc<EngineStats>,
    arenas: Arc<[Arc<Arena>]>,
    /// Next arena index handed to an unbound thread.
    arena_round_robin: AtomicUsize,
    /// One per arena, same index; carries cross-thread releases.
    deferred: Box<[Batcher<ExtentLease>]>,
    background: Arc<BackgroundThreads>,
    ccache: Option<CpuCache>,
    cpu_ids: Arc<dyn CpuIdSource>,
    clock: Arc<Clock>,
    /// Carries the pool's enabled flag across fork.
    fork_background: AtomicBool,
}

impl Engine {
    /// Boots an engine talking to the real OS.
    pub fn init(config: EngineConfig) -> Result<Self, InitError> {
        let pages: Arc<dyn PageOps> = Arc::new(SystemPages::new());
        Self::init_with(config, pages)
    }

    /// Boots an engine over an arbitrary page backend. Tests use this
    /// with `MockPages`.
    pub fn init_with(config: EngineConfig, pages: Arc<dyn PageOps>) -> Result<Self, InitError> {
        config.validate()?;
        let clock = Arc::new(Clock::new());
        let stats = Arc::new(EngineStats::new());
        let now = clock.now_ns();
        let arenas: Arc<[Arc<Arena>]> = (0..config.narenas)
            .map(|ind| {
                Arc::new(Arena::new(
                    ind as u32,
                    &config,
                    Arc::clone(&pages),
                    Arc::clone(&stats),
                    now,
                ))
            })
            .collect();
        let deferred = (0..config.narenas)
            .map(|_| Batcher::new(BATCHER_MAX_ELEMS))
            .collect();
        let background = Arc::new(BackgroundThreads::new(config.ncpus));
        if config.background_thread {
            background
                .enable(&arenas, &clock)
                .map_err(|_| InitError::WorkerSpawn)?;
        }
        let ccache = config
            .ccache
            .then(|| CpuCache::new(config.ncpus, config.ccache_nclasses, config.ccache_bin_capacity));
        let cpu_ids: Arc<dyn CpuIdSource> = Arc::new(SysCpu::new(config.ncpus));
        Ok(Self {
            config,
            stats,
            arenas,
            arena_round_robin: AtomicUsize::new(0),
            deferred,
            background,
            ccache,
            cpu_ids,
            clock,
            fork_background: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn narenas(&self) -> usize {
        self.arenas.len()
    }

    /// The calling thread's arena index, assigned round-robin on first
    /// use and sticky for the life of the (thread, engine) pair.
    #[must_use]
    pub fn thread_arena(&self) -> usize {
        let key = std::ptr::from_ref(self) as usize;
        THREAD_ARENA.with(|slot| match slot.get() {
            Some((k, ind)) if k == key && ind < self.arenas.len() => ind,
            _ => {
                let ind = self.arena_round_robin.fetch_add(1, Ordering::Relaxed) % self.arenas.len();
                slot.set(Some((key, ind)));
                ind
            }
        })
    }

    /// Acquires an extent of at least `npages` from the calling thread's
    /// arena, reusing cached memory before mapping fresh.
    pub fn extent_acquire(&self, npages: usize) -> Result<Lease, MapError> {
        let ind = self.thread_arena();
        let arena = &self.arenas[ind];
        self.drain_deferred(ind);
        let inner = arena.extent_acquire(npages, self.clock.now_ns())?;
        Ok(Lease {
            arena_ind: ind as u32,
            inner,
        })
    }

    /// Returns an extent to its owning arena's dirty cache. A release
    /// from a thread bound to a different arena is staged in the owner's
    /// batcher when there is room, so the releasing thread never touches
    /// the owner's locks.
    pub fn extent_release(&self, lease: Lease) {
        let ind = lease.arena_ind as usize;
        debug_assert!(ind < self.arenas.len());
        if ind != self.thread_arena() {
            match self.deferred[ind].try_push(lease.inner) {
                Ok(()) => return,
                // Batch full; fall through to the locking path.
                Err(inner) => self.release_now(ind, inner),
            }
            return;
        }
        self.release_now(ind, lease.inner);
    }

    fn release_now(&self, ind: usize, inner: ExtentLease) {
        let arena = &self.arenas[ind];
        let npages = arena.extent_release(inner);
        self.background
            .interval_check(arena, DecayTier::Dirty, npages);
    }

    /// Applies staged cross-thread releases to arena `ind`.
    fn drain_deferred(&self, ind: usize) {
        let Some(batch) = self.deferred[ind].pop_begin() else {
            return;
        };
        let arena = &self.arenas[ind];
        let mut npages = 0usize;
        for inner in batch {
            npages += arena.extent_release(inner);
        }
        if npages > 0 {
            self.background
                .interval_check(arena, DecayTier::Dirty, npages);
        }
    }

    /// One maintenance pass: drains every arena's deferred releases and
    /// runs its decay schedules. Background workers do the same on their
    /// own cadence; calling this is only needed when they are disabled.
    pub fn decay_tick(&self) {
        let now = self.clock.now_ns();
        for ind in 0..self.arenas.len() {
            self.drain_deferred(ind);
            self.arenas[ind].decay_tick(now);
        }
    }

    pub fn background_threads_enable(&self) -> std::io::Result<()> {
        self.background.enable(&self.arenas, &self.clock)
    }

    pub fn background_threads_disable(&self) {
        self.background.disable();
    }

    #[must_use]
    pub fn background_threads_enabled(&self) -> bool {
        self.background.enabled()
    }

    #[must_use]
    pub fn background_stats(&self) -> BackgroundStats {
        self.background.stats()
    }

    /// Allocation fast path. Objects are opaque words produced by
    /// `backend`; a cache hit skips the backend entirely. With the cache
    /// disabled or the class out of range, this is a plain single-object
    /// fill.
    pub fn ccache_alloc(&self, class: usize, backend: &dyn BinBackend) -> Option<usize> {
        if let Some(cache) = &self.ccache
            && cache.handles(class)
        {
            if let Some(obj) = cache.alloc(self.cpu_ids.as_ref(), class, backend) {
                return Some(obj);
            }
            // Locked bin or dry backend during refill.
            EngineStats::bump(&self.stats.cache_misses);
        }
        let mut one = [0usize; 1];
        (backend.fill(class, &mut one) == 1).then(|| one[0])
    }

    /// Deallocation fast path. Falls back to an immediate flush when the
    /// cache is disabled, the class is out of range, or the bin is owned
    /// by a peer.
    pub fn ccache_free(&self, class: usize, obj: usize, backend: &dyn BinBackend) {
        if let Some(cache) = &self.ccache
            && cache.handles(class)
        {
            match cache.free(self.cpu_ids.as_ref(), class, obj, backend) {
                Ok(()) => return,
                Err(back) => {
                    backend.flush(class, &[back]);
                    return;
                }
            }
        }
        backend.flush(class, &[obj]);
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Pages currently cached (dirty + muzzy) across all arenas.
    #[must_use]
    pub fn npages_cached(&self) -> usize {
        self.arenas.iter().map(|a| a.npages_cached()).sum()
    }

    /// Pages held as decommitted virtual reservations across all arenas.
    #[must_use]
    pub fn npages_retained(&self) -> usize {
        self.arenas.iter().map(|a| a.npages_retained()).sum()
    }

    /// Releases retained reservations, newest-kept, up to `max_npages`
    /// per arena. Returns the total pages unmapped.
    pub fn shrink_retained(&self, max_npages: usize) -> usize {
        self.arenas
            .iter()
            .map(|a| a.shrink_retained(max_npages))
            .sum()
    }

    /// Fork protocol, phase one: quiesce workers and take every engine
    /// lock in the documented order. The process must call exactly one of
    /// [`Self::postfork_parent`] or [`Self::postfork_child`] afterwards.
    pub fn prefork(&self) {
        let was_enabled = self.background.prefork();
        self.fork_background.store(was_enabled, Ordering::Relaxed);
        for arena in self.arenas.iter() {
            arena.prefork();
        }
    }

    /// Fork protocol, parent side: release the locks and revive the pool.
    pub fn postfork_parent(&self) -> std::io::Result<()> {
        for arena in self.arenas.iter() {
            arena.postfork();
        }
        self.background.postfork(
            self.fork_background.load(Ordering::Relaxed),
            &self.arenas,
            &self.clock,
        )
    }

    /// Fork protocol, child side: release the locks, reset half-committed
    /// lock-free state, and revive the pool. Threads do not survive fork,
    /// so pending batcher slots and locked cache bins belong to nobody.
    pub fn postfork_child(&self) -> std::io::Result<()> {
        for arena in self.arenas.iter() {
            arena.postfork();
        }
        for batcher in self.deferred.iter() {
            batcher.postfork_child();
        }
        if let Some(cache) = &self.ccache {
            cache.postfork_child();
        }
        self.background.postfork(
            self.fork_background.load(Ordering::Relaxed),
            &self.arenas,
            &self.clock,
        )
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.background.disable();
    }
}
