//! Concurrent memory-reclamation and extent-supply engine.
//!
//! Sits between a size-class allocator (bins/slabs, out of scope here) and
//! the OS virtual-memory interface. Freed page runs are not returned to
//! the OS immediately; they cool through a dirty → muzzy → retained
//! pipeline on a smoothed decay schedule, so short-lived allocation spikes
//! reuse still-mapped memory instead of paying map/unmap churn.
//!
//! # Architecture
//!
//! - **Batcher** (`batcher`): bounded lock-free handoff of object batches
//!   between threads
//! - **Extent metadata** (`edata`): per-extent records, lifecycle states,
//!   page-run size-class quantization
//! - **Extent sets** (`eset`): size-bucketed best-fit heaps with FIFO
//!   tie-break and an eviction LRU
//! - **Extent caches** (`ecache`): a locked eset per warmth tier with
//!   lock-free page counters
//! - **Address map** (`emap`): base-address index for neighbor coalescing
//! - **Decay** (`decay`): smootherstep purge schedule, epoch backlog,
//!   jittered deadlines
//! - **Arenas** (`arena`): extent acquire/release, split/coalesce, the
//!   purge walk
//! - **Background workers** (`background`): per-CPU purge threads with
//!   adaptive sleep and early wake
//! - **Per-CPU cache** (`ccache`): restart-protocol allocation fast path
//! - **Engine** (`engine`): process-wide context, public operations, fork
//!   protocol

pub mod arena;
pub mod background;
pub mod batcher;
pub mod ccache;
pub mod config;
pub mod decay;
pub mod ecache;
pub mod edata;
pub mod emap;
pub mod engine;
pub mod error;
pub mod eset;
pub mod pages;
pub mod stats;

pub use arena::{Arena, DecayTier, ExtentLease};
pub use batcher::{BATCHER_MAX_ELEMS, Batcher};
pub use config::EngineConfig;
pub use engine::{Clock, Engine, Lease};
pub use error::{InitError, MapError};
pub use pages::{PAGE, PAGE_SHIFT, PageOps};
pub use stats::StatsSnapshot;
