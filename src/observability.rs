//! Structured events of the compaction pipeline.
//!
//! Events are emitted through `tracing` under a single target so that an
//! application can route or silence them with one filter directive, e.g.
//! `RUST_LOG=profblock=debug`. The crate only emits events; installing a
//! subscriber is left to the binary embedding it.
//!
//! Each event names the part of the pipeline it comes from in `component`
//! (`compaction`, `object`, `dataset`, `writer`, `builder`) and what happened
//! in `event`. Block ids, paths and errors are recorded with `%`. Per-row
//! data is never logged; counts are aggregated per dataset or block.

/// Target shared by every event of the crate.
pub(crate) const PROFBLOCK_TARGET: &str = "profblock";

/// Info-level event, e.g.
/// `log_info!(component = "compaction", event = "block_compacted", block = %id)`.
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::PROFBLOCK_TARGET, $($field)*)
    };
}

macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::PROFBLOCK_TARGET, $($field)*)
    };
}

/// Swallowed errors on teardown paths.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::PROFBLOCK_TARGET, $($field)*)
    };
}

macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::PROFBLOCK_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
