//! Background purge workers.
//!
//! Up to one worker per CPU; arena `i` belongs to worker `i % ncpus`. Each
//! worker loops over its arenas running decay passes, then sleeps for the
//! shortest interval whose projected purge volume stays under a fixed page
//! threshold, or indefinitely when no arena has decayable backlog.
//! Application threads can cut a sleep short through [`interval_check`],
//! which uses trylocks exclusively so the release fast path never blocks
//! on purge work.
//!
//! Lock order: pool lock, then a worker's state lock, then a decay lock.
//!
//! [`interval_check`]: BackgroundThreads::interval_check

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::arena::{Arena, DecayTier};
use crate::engine::Clock;

/// Projected purge volume, in pages, that justifies a wakeup.
pub const NPAGES_THRESHOLD: u64 = 1024;
/// Shortest sleep a worker will schedule.
pub const MIN_INTERVAL_NS: u64 = 100_000_000;
/// Sentinel wakeup time for an indefinite sleep.
pub const INDEFINITE_SLEEP_NS: u64 = u64::MAX;

#[derive(Debug)]
struct WorkerState {
    started: bool,
    /// Absolute wakeup time on the engine clock, [`INDEFINITE_SLEEP_NS`]
    /// while parked without a deadline, 0 while not running.
    wakeup_ns: u64,
    /// Projected purge pages accumulated by interval checks since the last
    /// run.
    npages_to_purge_new: u64,
    tot_n_runs: u64,
    tot_sleep_ns: u64,
}

struct Worker {
    state: Mutex<WorkerState>,
    cond: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState {
                started: false,
                wakeup_ns: 0,
                npages_to_purge_new: 0,
                tot_n_runs: 0,
                tot_sleep_ns: 0,
            }),
            cond: Condvar::new(),
            handle: Mutex::new(None),
        }
    }
}

/// Aggregate view of the pool, taken under the pool lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackgroundStats {
    pub num_threads: usize,
    pub num_runs: u64,
    pub sleep_ns: u64,
}

pub struct BackgroundThreads {
    /// Serializes enable/disable/fork transitions.
    pool: Mutex<()>,
    enabled: AtomicBool,
    workers: Box<[Worker]>,
}

impl BackgroundThreads {
    #[must_use]
    pub fn new(ncpus: usize) -> Self {
        Self {
            pool: Mutex::new(()),
            enabled: AtomicBool::new(false),
            workers: (0..ncpus).map(|_| Worker::new()).collect(),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Spawns one worker per CPU slot that owns at least one arena. Calling
    /// while already enabled is a no-op.
    pub fn enable(
        self: &Arc<Self>,
        arenas: &Arc<[Arc<Arena>]>,
        clock: &Arc<Clock>,
    ) -> std::io::Result<()> {
        let _pool = self.pool.lock();
        if self.enabled.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let nworkers = self.workers.len().min(arenas.len());
        for ind in 0..nworkers {
            self.spawn_worker(ind, arenas, clock)?;
        }
        Ok(())
    }

    fn spawn_worker(
        self: &Arc<Self>,
        ind: usize,
        arenas: &Arc<[Arc<Arena>]>,
        clock: &Arc<Clock>,
    ) -> std::io::Result<()> {
        {
            let mut state = self.workers[ind].state.lock();
            debug_assert!(!state.started);
            state.started = true;
            state.wakeup_ns = INDEFINITE_SLEEP_NS;
            state.npages_to_purge_new = 0;
        }
        let pool = Arc::clone(self);
        let arenas = Arc::clone(arenas);
        let clock = Arc::clone(clock);
        let handle = std::thread::Builder::new()
            .name(format!("quietus-bg-{ind}"))
            .spawn(move || pool.worker_loop(ind, &arenas, &clock))?;
        *self.workers[ind].handle.lock() = Some(handle);
        Ok(())
    }

    /// Stops and joins every worker. Required before fork; threads do not
    /// survive it.
    pub fn disable(&self) {
        let _pool = self.pool.lock();
        self.enabled.store(false, Ordering::Relaxed);
        for worker in self.workers.iter() {
            {
                let mut state = worker.state.lock();
                if !state.started {
                    continue;
                }
                state.started = false;
                worker.cond.notify_one();
            }
            if let Some(handle) = worker.handle.lock().take() {
                let _ = handle.join();
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> BackgroundStats {
        let _pool = self.pool.lock();
        let mut out = BackgroundStats::default();
        for worker in self.workers.iter() {
            let state = worker.state.lock();
            if state.started {
                out.num_threads += 1;
            }
            out.num_runs += state.tot_n_runs;
            out.sleep_ns += state.tot_sleep_ns;
        }
        out
    }

    fn worker_loop(&self, ind: usize, arenas: &[Arc<Arena>], clock: &Clock) {
        let worker = &self.workers[ind];
        let ncpus = self.workers.len();
        let mut state = worker.state.lock();
        state.wakeup_ns = INDEFINITE_SLEEP_NS;
        while state.started {
            // The state lock stays held across the pass; interval checks
            // trylock it and skip rather than wait.
            let interval = Self::work_once(ind, ncpus, arenas, clock);
            state.tot_n_runs += 1;
            state.npages_to_purge_new = 0;

            let before = clock.now_ns();
            if interval == INDEFINITE_SLEEP_NS {
                state.wakeup_ns = INDEFINITE_SLEEP_NS;
                worker.cond.wait(&mut state);
            } else {
                debug_assert!(interval >= MIN_INTERVAL_NS);
                state.wakeup_ns = before + interval;
                let _ = worker
                    .cond
                    .wait_for(&mut state, Duration::from_nanos(interval));
                state.wakeup_ns = INDEFINITE_SLEEP_NS;
            }
            state.tot_sleep_ns += clock.now_ns().saturating_sub(before);
        }
        state.wakeup_ns = 0;
    }

    /// One pass over the worker's arena stripe. Returns the next sleep
    /// interval, bailing out at the minimum as soon as any arena demands it.
    fn work_once(ind: usize, ncpus: usize, arenas: &[Arc<Arena>], clock: &Clock) -> u64 {
        let mut min_interval = INDEFINITE_SLEEP_NS;
        for arena in arenas.iter().skip(ind).step_by(ncpus) {
            arena.decay_tick(clock.now_ns());
            let interval = Self::compute_purge_interval(arena);
            if interval == MIN_INTERVAL_NS {
                return interval;
            }
            min_interval = min_interval.min(interval);
        }
        min_interval
    }

    fn compute_purge_interval(arena: &Arena) -> u64 {
        let dirty = Self::compute_purge_interval_tier(arena, DecayTier::Dirty);
        if dirty == MIN_INTERVAL_NS {
            return dirty;
        }
        dirty.min(Self::compute_purge_interval_tier(arena, DecayTier::Muzzy))
    }

    /// Shortest interval after which this tier would accumulate enough
    /// purgeable pages to be worth a wakeup. Contention on the decay lock
    /// yields the minimum interval rather than a wait.
    fn compute_purge_interval_tier(arena: &Arena, tier: DecayTier) -> u64 {
        let decay = arena.decay(tier);
        let Some(state) = decay.try_lock() else {
            return MIN_INTERVAL_NS;
        };
        if decay.decay_ms() <= 0 {
            // Purging is eager or disabled; nothing to schedule.
            return INDEFINITE_SLEEP_NS;
        }
        let decay_interval_ns = state.interval_ns();
        debug_assert!(decay_interval_ns > 0);
        let npages = arena.ecache(tier).npages();
        if npages == 0 && state.backlog_total() == 0 {
            return INDEFINITE_SLEEP_NS;
        }
        let nsteps = state.nsteps();
        if npages as u64 <= NPAGES_THRESHOLD {
            return (decay_interval_ns * nsteps as u64).max(MIN_INTERVAL_NS);
        }

        let mut lb = ((MIN_INTERVAL_NS / decay_interval_ns) as usize).max(2);
        let mut ub = nsteps;
        if decay_interval_ns * ub as u64 <= MIN_INTERVAL_NS || lb + 2 > ub {
            return MIN_INTERVAL_NS;
        }
        let mut npurge_lb = state.npurge_after_interval(lb);
        if npurge_lb as u64 > NPAGES_THRESHOLD {
            return (decay_interval_ns * lb as u64).max(MIN_INTERVAL_NS);
        }
        let mut npurge_ub = state.npurge_after_interval(ub);
        if (npurge_ub as u64) < NPAGES_THRESHOLD {
            return (decay_interval_ns * ub as u64).max(MIN_INTERVAL_NS);
        }
        while (npurge_lb as u64 + NPAGES_THRESHOLD) < npurge_ub as u64 && lb + 2 < ub {
            let target = (lb + ub) / 2;
            let npurge = state.npurge_after_interval(target);
            if npurge as u64 > NPAGES_THRESHOLD {
                ub = target;
                npurge_ub = npurge;
            } else {
                lb = target;
                npurge_lb = npurge;
            }
        }
        (decay_interval_ns * ((lb + ub) as u64) / 2).max(MIN_INTERVAL_NS)
    }

    /// Opportunistic early-wake check, called when `npages_new` pages drop
    /// into `tier`'s cache. Entirely trylock-based: any contention defers
    /// the decision to the worker's own schedule.
    pub fn interval_check(&self, arena: &Arena, tier: DecayTier, npages_new: usize) {
        if !self.enabled() || self.workers.is_empty() {
            return;
        }
        let worker = &self.workers[arena.ind() as usize % self.workers.len()];
        let Some(mut wstate) = worker.state.try_lock() else {
            return;
        };
        if !wstate.started {
            return;
        }
        let decay = arena.decay(tier);
        let Some(dstate) = decay.try_lock() else {
            return;
        };
        if decay.decay_ms() <= 0 {
            return;
        }
        let decay_interval_ns = dstate.interval_ns();
        debug_assert!(decay_interval_ns > 0);

        let wakeup = wstate.wakeup_ns;
        if wakeup <= dstate.epoch_ns() {
            return;
        }
        let diff = wakeup - dstate.epoch_ns();
        if diff < MIN_INTERVAL_NS {
            return;
        }

        if npages_new > 0 {
            let n_epoch = (diff / decay_interval_ns) as usize;
            wstate.npages_to_purge_new += dstate.projected_purge(npages_new, n_epoch);
        }

        let should_signal = wstate.npages_to_purge_new > NPAGES_THRESHOLD
            || (wakeup == INDEFINITE_SLEEP_NS
                && (arena.npages_cached() > 0 || wstate.npages_to_purge_new > 0));
        if should_signal {
            wstate.npages_to_purge_new = 0;
            worker.cond.notify_one();
        }
    }

    /// Fork protocol, first phase: tears the workers down and reports
    /// whether the pool should be revived afterwards.
    pub fn prefork(&self) -> bool {
        let was_enabled = self.enabled();
        if was_enabled {
            self.disable();
        }
        was_enabled
    }

    /// Fork protocol, second phase, run in both parent and child.
    pub fn postfork(
        self: &Arc<Self>,
        was_enabled: bool,
        arenas: &Arc<[Arc<Arena>]>,
        clock: &Arc<Clock>,
    ) -> std::io::Result<()> {
        if was_enabled {
            self.enable(arenas, clock)?;
        }
        Ok(())
    }
}
