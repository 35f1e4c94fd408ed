//! Block compaction for a continuous-profiling store.
//!
//! Profiles are stored in immutable block objects. Each block holds one or
//! more datasets, the profiles of one tenant and service, split into
//! sections: a columnar profile table, a time index of series and a symbol
//! database of stack traces. Fresh blocks (segments) are written by
//! [`BlockBuilder`]; [`compact`] merges blocks of a shard into one block per
//! tenant at the next compaction level.

/// Logging macros over `tracing`.
mod observability;

/// Error types shared by every module.
pub mod error;

/// Options of compaction and object loading.
pub mod option;

/// Binary encoding of metadata and small sections.
pub mod serdes;

/// String interning for metadata.
pub mod strings;

/// Block and dataset metadata and the block trailer.
pub mod meta;

/// Deterministic block identifiers.
pub mod id;

/// Size-classed pooled buffers.
pub mod bufferpool;

/// Task groups with shared cancellation.
pub mod executor;

/// Object layout in storage and range readers.
pub mod fs;

/// Reference-counted block objects.
pub mod object;

/// Datasets of a block object.
pub mod dataset;

/// Dataset sections and their openers.
pub mod section;

/// Schema of the profile table.
pub mod schema;

/// Series labels and the time index.
pub mod tsdb;

/// Symbol database of stack traces.
pub mod symdb;

/// Ordered, merged streams of profile rows.
pub mod stream;

/// Block compaction.
pub mod compaction;

/// Streaming upload of block objects.
pub mod writer;

/// Segment blocks from raw profiles.
pub mod builder;

pub use crate::{
    builder::{BlockBuilder, RawProfile, RawSample},
    compaction::{compact, plan_compaction, CompactionPlan, CompactionStats, SampleObserver},
    dataset::Dataset,
    error::BlockError,
    meta::{read_block_meta, BlockMeta, DatasetMeta},
    object::{Object, Objects},
    option::{CompactionOptions, ObjectOptions},
    section::Section,
};
