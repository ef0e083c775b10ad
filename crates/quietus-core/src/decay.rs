//! Smoothed decay scheduling.
//!
//! A `Decay` turns "unused pages linger for roughly `decay_ms`
//! milliseconds" into a sequence of page-count limits. The decay window is
//! divided into `nsteps` equal epochs; each epoch records how many pages
//! went unused during it (the backlog), and the limit at any instant is
//! the backlog convolved with a smootherstep curve in 24-bit fixed point.
//! Pages therefore drain gradually, with the steepest decline in the
//! middle of the window and flat approaches at both ends.
//!
//! All time values are nanoseconds on the caller's monotonic clock.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::config::{DECAY_MS_EAGER, DECAY_MS_NEVER};

/// Fixed-point precision of the smoothing table.
pub const SMOOTHSTEP_BFP: u32 = 24;

const NS_PER_MS: u64 = 1_000_000;

/// Largest decay time accepted, in milliseconds. Bounds interval
/// arithmetic away from overflow.
const DECAY_MS_MAX: i64 = (i64::MAX / NS_PER_MS as i64) / 2;

/// Whether `decay_ms` is one of the accepted values: -1 (never purge),
/// 0 (purge eagerly), or a positive half-life in milliseconds.
#[must_use]
pub fn decay_ms_valid(decay_ms: i64) -> bool {
    decay_ms >= DECAY_MS_NEVER && decay_ms <= DECAY_MS_MAX
}

/// Tabulates smootherstep(x) = 6x^5 - 15x^4 + 10x^3 at x = (i+1)/nsteps,
/// scaled to 24-bit fixed point. The table is strictly increasing and ends
/// at exactly 1.0.
#[must_use]
pub fn smoothstep_table(nsteps: usize) -> Vec<u64> {
    let one = 1u64 << SMOOTHSTEP_BFP;
    assert!(nsteps > 0 && nsteps as u64 <= one);
    let mut table = Vec::with_capacity(nsteps);
    let mut prev = 0u64;
    for i in 0..nsteps {
        let x = (i + 1) as f64 / nsteps as f64;
        let s = x * x * x * (x * (x * 6.0 - 15.0) + 10.0);
        let mut h = (s * one as f64).round() as u64;
        // Strict monotonicity keeps npurge_after_interval well defined
        // even where adjacent samples round to the same value. The cap
        // leaves one unit of headroom per remaining entry so samples
        // that saturate near 1.0 cannot collapse onto each other.
        if h <= prev {
            h = prev + 1;
        }
        let cap = one - (nsteps - 1 - i) as u64;
        if h > cap {
            h = cap;
        }
        table.push(h);
        prev = h;
    }
    table
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

pub struct DecayState {
    nsteps: usize,
    h_steps: Vec<u64>,
    /// Epoch length; zero when decay is disabled or eager.
    interval_ns: u64,
    epoch_ns: u64,
    deadline_ns: u64,
    jitter_state: u64,
    /// Page count recorded at the last epoch advance. Pages above this are
    /// "new this epoch" and not yet subject to decay.
    nunpurged: usize,
    /// backlog[nsteps-1] is the newest epoch's contribution.
    backlog: Vec<usize>,
    /// Cached convolution of backlog with h_steps.
    backlog_limit: usize,
    /// Guards against reentrant purging through the same tier.
    purging: bool,
}

impl DecayState {
    fn reinit(&mut self, decay_ms: i64, now_ns: u64) {
        self.interval_ns = if decay_ms > 0 {
            ((decay_ms as u64) * NS_PER_MS / self.nsteps as u64).max(1)
        } else {
            0
        };
        self.epoch_ns = now_ns;
        self.deadline_init(decay_ms);
        self.backlog.iter_mut().for_each(|b| *b = 0);
        self.backlog_limit = 0;
        self.nunpurged = 0;
    }

    fn deadline_init(&mut self, decay_ms: i64) {
        self.deadline_ns = self.epoch_ns + self.interval_ns;
        if decay_ms > 0 && self.interval_ns > 0 {
            let jitter = splitmix64(&mut self.jitter_state) % self.interval_ns;
            self.deadline_ns += jitter;
        }
    }

    #[must_use]
    fn deadline_reached(&self, now_ns: u64) -> bool {
        now_ns >= self.deadline_ns
    }

    fn backlog_limit_compute(&self) -> usize {
        let mut sum = 0u64;
        for (b, h) in self.backlog.iter().zip(self.h_steps.iter()) {
            sum += *b as u64 * *h;
        }
        (sum >> SMOOTHSTEP_BFP) as usize
    }

    fn epoch_advance(&mut self, decay_ms: i64, now_ns: u64, npages_current: usize) {
        debug_assert!(self.deadline_reached(now_ns));
        debug_assert!(self.interval_ns > 0);
        let nadvance = ((now_ns - self.epoch_ns) / self.interval_ns).max(1);
        self.epoch_ns += nadvance * self.interval_ns;
        self.deadline_init(decay_ms);

        let nsteps = self.nsteps;
        if nadvance as usize >= nsteps {
            self.backlog[..nsteps - 1].iter_mut().for_each(|b| *b = 0);
        } else {
            let n = nadvance as usize;
            self.backlog.copy_within(n.., 0);
            self.backlog[nsteps - n..nsteps - 1]
                .iter_mut()
                .for_each(|b| *b = 0);
        }
        let delta = npages_current.saturating_sub(self.nunpurged);
        self.nunpurged = npages_current;
        self.backlog[nsteps - 1] = delta;
        self.backlog_limit = self.backlog_limit_compute();
    }

    /// Pages allowed to remain at this instant. Pages that appeared since
    /// the last epoch advance have not aged at all, so they extend the
    /// backlog limit.
    #[must_use]
    pub fn npages_limit(&self, npages_current: usize) -> usize {
        self.backlog_limit + npages_current.saturating_sub(self.nunpurged)
    }

    /// Pages that would become purgeable if `nintervals` epochs elapsed
    /// with no further frees: each backlog entry ages by `nintervals`
    /// steps of the smoothing curve.
    #[must_use]
    pub fn npurge_after_interval(&self, nintervals: usize) -> usize {
        let mut sum = 0u64;
        for (i, b) in self.backlog.iter().enumerate() {
            let weight = if i < nintervals {
                self.h_steps[i]
            } else {
                self.h_steps[i] - self.h_steps[i - nintervals]
            };
            sum += *b as u64 * weight;
        }
        (sum >> SMOOTHSTEP_BFP) as usize
    }

    #[must_use]
    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }

    #[must_use]
    pub fn deadline_ns(&self) -> u64 {
        self.deadline_ns
    }

    #[must_use]
    pub fn epoch_ns(&self) -> u64 {
        self.epoch_ns
    }

    /// Of `npages_new` pages freed now, how many the smoothing curve would
    /// schedule for purging within the next `n_epoch` steps.
    #[must_use]
    pub fn projected_purge(&self, npages_new: usize, n_epoch: usize) -> u64 {
        if n_epoch >= self.nsteps {
            return npages_new as u64;
        }
        let h_max = self.h_steps[self.nsteps - 1];
        let aged = h_max - self.h_steps[self.nsteps - 1 - n_epoch];
        (npages_new as u64 * aged) >> SMOOTHSTEP_BFP
    }

    #[must_use]
    pub fn nsteps(&self) -> usize {
        self.nsteps
    }

    /// Sum of the aged backlog, i.e. pages still awaiting gradual purge.
    #[must_use]
    pub fn backlog_total(&self) -> usize {
        self.backlog.iter().sum()
    }

    pub fn purging_set(&mut self, purging: bool) {
        debug_assert_ne!(self.purging, purging);
        self.purging = purging;
    }

    #[must_use]
    pub fn purging(&self) -> bool {
        self.purging
    }
}

/// One decay tier's scheduler. The half-life is readable without the
/// state lock; everything else lives behind it.
pub struct Decay {
    decay_ms: AtomicI64,
    state: Mutex<DecayState>,
}

impl Decay {
    /// `seed` perturbs the deadline jitter stream so tiers and arenas do
    /// not purge in lockstep.
    #[must_use]
    pub fn new(decay_ms: i64, nsteps: usize, seed: u64, now_ns: u64) -> Self {
        debug_assert!(decay_ms_valid(decay_ms));
        let mut state = DecayState {
            nsteps,
            h_steps: smoothstep_table(nsteps),
            interval_ns: 0,
            epoch_ns: 0,
            deadline_ns: 0,
            jitter_state: seed,
            nunpurged: 0,
            backlog: vec![0; nsteps],
            backlog_limit: 0,
            purging: false,
        };
        state.reinit(decay_ms, now_ns);
        Self {
            decay_ms: AtomicI64::new(decay_ms),
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn decay_ms(&self) -> i64 {
        self.decay_ms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn never(&self) -> bool {
        self.decay_ms() == DECAY_MS_NEVER
    }

    #[must_use]
    pub fn eager(&self) -> bool {
        self.decay_ms() == DECAY_MS_EAGER
    }

    pub fn lock(&self) -> MutexGuard<'_, DecayState> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, DecayState>> {
        self.state.try_lock()
    }

    /// Fork support only. The caller must own the lock via a forgotten
    /// guard from the prefork phase.
    pub(crate) unsafe fn force_unlock(&self) {
        unsafe { self.state.force_unlock() }
    }

    /// Changes the half-life, restarting the backlog from scratch. The
    /// caller is expected to follow up with a purge pass; a shorter
    /// half-life can make many pages immediately purgeable.
    pub fn decay_ms_set(&self, decay_ms: i64, now_ns: u64) -> bool {
        if !decay_ms_valid(decay_ms) {
            return false;
        }
        let mut state = self.state.lock();
        self.decay_ms.store(decay_ms, Ordering::Relaxed);
        state.reinit(decay_ms, now_ns);
        true
    }

    /// Advances the epoch if the deadline has passed, folding pages that
    /// appeared since the previous advance into the newest backlog slot.
    /// Returns true when an advance happened, meaning the limit may have
    /// dropped and a purge check is warranted.
    ///
    /// A `now_ns` earlier than the current epoch means the clock went
    /// backwards; the deadline is treated as reached so decay keeps
    /// making progress.
    pub fn maybe_advance_epoch(
        &self,
        state: &mut DecayState,
        now_ns: u64,
        npages_current: usize,
    ) -> bool {
        let decay_ms = self.decay_ms();
        if decay_ms <= 0 {
            return false;
        }
        let now_ns = if now_ns < state.epoch_ns {
            state.deadline_ns
        } else {
            now_ns
        };
        if !state.deadline_reached(now_ns) {
            return false;
        }
        state.epoch_advance(decay_ms, now_ns, npages_current);
        true
    }
}
