//! Compaction of block objects.
//!
//! A compaction takes blocks of one shard and rewrites their datasets into
//! one new block per tenant, one level above the highest input level. Rows of
//! datasets sharing a tenant and name are merged in series order, their
//! series renumbered and their stack traces moved into a single symbol
//! database.

/// Per-dataset merge pipeline.
mod dataset;
/// Grouping of input datasets into output blocks.
mod plan;
/// Section writers of a compacted dataset.
pub(crate) mod rewrite;

use std::{ops::AddAssign, sync::Arc};

use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;

pub use self::plan::{plan_compaction, CompactionPlan};
use crate::{
    error::{with_cleanup, BlockError},
    meta::BlockMeta,
    stream::ProfileEntry,
    object::{Object, Objects},
    observability::{log_error, log_info},
    option::CompactionOptions,
};

/// Sees every row appended to a compacted dataset.
///
/// Calls for one dataset come from a single task, in output order. The entry
/// references the stack traces of the output symbol database.
pub trait SampleObserver: Send + Sync {
    fn observe(&self, dataset: &str, entry: &ProfileEntry);

    /// Called once the symbols of a dataset are flushed.
    fn flush_symbols(&self) {}
}

/// Counters of a compacted dataset or block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Series of the rewritten time index.
    pub series: u64,
    /// Stack trace references rewritten into the new symbol database.
    pub samples: u64,
    /// Rows written to the new profile table.
    pub profiles: u64,
}

impl AddAssign for CompactionStats {
    fn add_assign(&mut self, other: Self) {
        self.series += other.series;
        self.samples += other.samples;
        self.profiles += other.profiles;
    }
}

/// Compact `blocks`, read from `storage`, into new blocks.
///
/// Every input block is rewritten, even a single one. The result holds one
/// block per tenant, ordered by tenant. On error nothing is returned and
/// outputs that were already uploaded must be discarded by the caller.
pub async fn compact(
    cancel: &CancellationToken,
    blocks: Vec<BlockMeta>,
    storage: Arc<dyn ObjectStore>,
    options: CompactionOptions,
) -> Result<Vec<BlockMeta>, BlockError> {
    let objects = Objects::new(
        blocks
            .into_iter()
            .map(|meta| {
                Arc::new(Object::new(
                    storage.clone(),
                    meta,
                    options.object_options.clone(),
                ))
            })
            .collect(),
    );
    let mut plans = plan_compaction(&objects)?;

    objects
        .open(cancel)
        .await
        .map_err(|err| err.context("opening objects"))?;
    let destination = options.destination.clone().unwrap_or(storage);

    let mut compacted = Vec::with_capacity(plans.len());
    for plan in &mut plans {
        match plan.compact(cancel, destination.clone(), &options).await {
            Ok(meta) => compacted.push(meta),
            Err(err) => {
                log_error!(
                    component = "compaction",
                    event = "compaction_failed",
                    tenant = %plan.tenant(),
                    block = %plan.id(),
                    error = %err,
                );
                return Err(with_cleanup(err, objects.close(None).await));
            }
        }
    }
    objects.close(None).await?;

    log_info!(
        component = "compaction",
        event = "compaction_finished",
        inputs = objects.len(),
        outputs = compacted.len(),
    );
    Ok(compacted)
}
