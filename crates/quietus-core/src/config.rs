//! Engine configuration.
//!
//! All knobs are read once at `Engine::init` and never mutated afterwards.
//! Defaults can be overridden from the environment:
//!
//! - `QUIETUS_DIRTY_DECAY_MS` / `QUIETUS_MUZZY_DECAY_MS`: decay half-life in
//!   milliseconds; `-1` disables purging for the tier, `0` purges eagerly.
//! - `QUIETUS_BACKGROUND_THREAD`: `on`/`off` (also `true`/`1`, `false`/`0`).
//! - `QUIETUS_CCACHE`: `on`/`off` for the per-CPU cache fast path.

use crate::decay::decay_ms_valid;
use crate::error::InitError;

/// Default decay half-life for the dirty tier, in milliseconds.
pub const DIRTY_DECAY_MS_DEFAULT: i64 = 10_000;
/// Default decay half-life for the muzzy tier, in milliseconds.
pub const MUZZY_DECAY_MS_DEFAULT: i64 = 10_000;
/// Number of smoothing sub-intervals per decay half-life.
pub const SMOOTHING_STEPS_DEFAULT: usize = 200;
/// Default per-(CPU, size-class) bin capacity in objects.
pub const CCACHE_BIN_CAPACITY_DEFAULT: usize = 39;
/// Sentinel for "purging disabled" decay time.
pub const DECAY_MS_NEVER: i64 = -1;
/// Sentinel for "purge eagerly" decay time.
pub const DECAY_MS_EAGER: i64 = 0;

/// Read-once engine configuration.
///
/// Single-writer-at-init, multi-reader-after-init: the `Engine` clones this
/// at boot and threads it through component constructors.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of arenas to create.
    pub narenas: usize,
    /// Number of CPU slots for boot-sized arrays (background worker info,
    /// per-CPU cache instances). Never resized after init.
    pub ncpus: usize,
    /// Dirty-tier decay half-life in ms (-1 never, 0 eager).
    pub dirty_decay_ms: i64,
    /// Muzzy-tier decay half-life in ms (-1 never, 0 eager).
    pub muzzy_decay_ms: i64,
    /// Number of smoothing sub-intervals in the decay window.
    pub smoothing_steps: usize,
    /// Whether background purge threads are enabled at boot.
    pub background_thread: bool,
    /// Whether the per-CPU cache fast path is enabled.
    pub ccache: bool,
    /// Per-(CPU, size-class) bin capacity in objects.
    pub ccache_bin_capacity: usize,
    /// Number of size classes handled by the per-CPU cache.
    pub ccache_nclasses: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let ncpus = available_cpus();
        Self {
            narenas: ncpus.max(1),
            ncpus,
            dirty_decay_ms: DIRTY_DECAY_MS_DEFAULT,
            muzzy_decay_ms: MUZZY_DECAY_MS_DEFAULT,
            smoothing_steps: SMOOTHING_STEPS_DEFAULT,
            background_thread: false,
            ccache: false,
            ccache_bin_capacity: CCACHE_BIN_CAPACITY_DEFAULT,
            ccache_nclasses: 36,
        }
    }
}

impl EngineConfig {
    /// Returns the default configuration with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = env_i64("QUIETUS_DIRTY_DECAY_MS") {
            cfg.dirty_decay_ms = ms;
        }
        if let Some(ms) = env_i64("QUIETUS_MUZZY_DECAY_MS") {
            cfg.muzzy_decay_ms = ms;
        }
        if let Some(on) = env_bool("QUIETUS_BACKGROUND_THREAD") {
            cfg.background_thread = on;
        }
        if let Some(on) = env_bool("QUIETUS_CCACHE") {
            cfg.ccache = on;
        }
        cfg
    }

    /// Validates the configuration, returning the first rejection.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.ncpus == 0 {
            return Err(InitError::ZeroCpus);
        }
        if self.narenas == 0 {
            return Err(InitError::ZeroArenas);
        }
        if !decay_ms_valid(self.dirty_decay_ms) {
            return Err(InitError::InvalidDecayMs(self.dirty_decay_ms));
        }
        if !decay_ms_valid(self.muzzy_decay_ms) {
            return Err(InitError::InvalidDecayMs(self.muzzy_decay_ms));
        }
        if self.smoothing_steps == 0 {
            return Err(InitError::ZeroSmoothingSteps);
        }
        if self.ccache && self.ccache_bin_capacity < 2 {
            return Err(InitError::BinCapacity(self.ccache_bin_capacity));
        }
        Ok(())
    }
}

/// Best-effort CPU count; 1 if the platform gives no answer.
#[must_use]
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_decay_time() {
        let cfg = EngineConfig {
            dirty_decay_ms: -7,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.validate(), Err(InitError::InvalidDecayMs(-7)));
    }

    // Oversized half-lives would overflow the ns conversion inside the
    // scheduler, so validate() must reject them up front.
    #[test]
    fn rejects_overflowing_decay_time() {
        let cfg = EngineConfig {
            dirty_decay_ms: i64::MAX,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.validate(), Err(InitError::InvalidDecayMs(i64::MAX)));
    }

    #[test]
    fn rejects_tiny_bin_capacity() {
        let cfg = EngineConfig {
            ccache: true,
            ccache_bin_capacity: 1,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.validate(), Err(InitError::BinCapacity(1)));
    }

    #[test]
    fn rejects_zero_arenas() {
        let cfg = EngineConfig {
            narenas: 0,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.validate(), Err(InitError::ZeroArenas));
    }
}
