//! Run statistics.
//!
//! Counters for everything the pipeline drops, suppresses or dispatches,
//! persisted across runs so `fallwatch status` can report them.

pub mod log;

pub use log::{create_shared_stats, Counter, RunStats, SharedStats, StatsLog};
