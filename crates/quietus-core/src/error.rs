//! Error taxonomy for the reclamation engine.
//!
//! Only two conditions are representable as errors: boot-time
//! misconfiguration and OS mapping exhaustion. Scheduling contention is
//! handled by skipping the contended cycle, and invariant violations are
//! debug-checked rather than surfaced — see the crate docs.

use thiserror::Error;

/// Boot-time configuration rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    /// A decay half-life below -1 ms (-1 = never purge, 0 = purge eagerly).
    #[error("invalid decay half-life {0} ms (must be >= -1)")]
    InvalidDecayMs(i64),
    /// The engine needs at least one CPU slot for its boot-sized arrays.
    #[error("cpu count must be nonzero")]
    ZeroCpus,
    /// The engine needs at least one arena.
    #[error("arena count must be nonzero")]
    ZeroArenas,
    /// Per-CPU cache bins need room for at least two objects so that the
    /// half-capacity refill/flush fractions stay meaningful.
    #[error("per-cpu bin capacity {0} is too small (minimum 2)")]
    BinCapacity(usize),
    /// The decay smoothing window must have at least one step.
    #[error("smoothing step count must be nonzero")]
    ZeroSmoothingSteps,
    /// The OS refused to spawn a background worker at boot.
    #[error("failed to spawn background purge worker")]
    WorkerSpawn,
}

/// OS virtual-memory exhaustion. Propagated to the caller, never retried
/// automatically, never fatal by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page mapping of {size} bytes failed")]
pub struct MapError {
    /// Requested mapping size in bytes.
    pub size: usize,
}
