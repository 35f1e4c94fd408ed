use std::{fmt, io, sync::Arc};

use thiserror::Error;

use crate::section::Section;

/// Errors produced while reading, compacting or writing blocks.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Compaction was requested with an empty input set.
    #[error("no blocks to merge")]
    NoBlocksToMerge,
    /// Input blocks belong to different shards.
    #[error("only blocks from the same shard can be merged")]
    ShardMergeMismatch,
    #[error("block io error: {0}")]
    Io(#[from] io::Error),
    #[error("block object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("block parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("block arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("block ulid decode error: {0}")]
    UlidDecode(#[from] ulid::DecodeError),
    #[error("block task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// Malformed metadata, table of contents or section payload.
    #[error("invalid block data: {0}")]
    Corrupted(String),
    #[error("section {0} is not open")]
    SectionNotOpen(Section),
    #[error("section {section} is not present in dataset format {format}")]
    SectionNotFound { section: Section, format: u32 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panic(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<BlockError>,
    },
    /// A remembered error replayed to every caller of a poisoned resource.
    #[error(transparent)]
    Shared(Arc<BlockError>),
    #[error("{0}")]
    Multiple(MultiError),
}

impl BlockError {
    /// Wrap the error with a description of the failing stage or resource.
    pub fn context(self, context: impl Into<String>) -> Self {
        BlockError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Follow context wrappers and shared handles down to the originating error.
    pub fn root(&self) -> &BlockError {
        match self {
            BlockError::Context { source, .. } => source.root(),
            BlockError::Shared(err) => err.root(),
            err => err,
        }
    }

    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        BlockError::Corrupted(msg.into())
    }
}

impl From<BlockError> for parquet::errors::ParquetError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::Parquet(err) => err,
            err => parquet::errors::ParquetError::External(Box::new(err)),
        }
    }
}

/// Collects errors from a stage and from the release of its resources.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<BlockError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: Result<(), BlockError>) {
        if let Err(err) = result {
            self.errors.push(err);
        }
    }

    pub fn push(&mut self, err: BlockError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[BlockError] {
        &self.errors
    }

    /// Resolve to `Ok(())`, the only error, or [`BlockError::Multiple`].
    pub fn into_result(mut self) -> Result<(), BlockError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(BlockError::Multiple(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

/// Combine the outcome of a stage with the outcome of releasing its resources.
pub(crate) fn join_errors(
    stage: Result<(), BlockError>,
    cleanup: Result<(), BlockError>,
) -> Result<(), BlockError> {
    let mut merr = MultiError::new();
    merr.add(stage);
    merr.add(cleanup);
    merr.into_result()
}

/// Attach the outcome of a release to an error that already happened.
pub(crate) fn with_cleanup(err: BlockError, cleanup: Result<(), BlockError>) -> BlockError {
    match cleanup {
        Ok(()) => err,
        Err(cleanup) => {
            let mut merr = MultiError::new();
            merr.push(err);
            merr.push(cleanup);
            BlockError::Multiple(merr)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{join_errors, BlockError, MultiError};

    #[test]
    fn multi_error_resolution() {
        assert!(MultiError::new().into_result().is_ok());

        let mut merr = MultiError::new();
        merr.add(Err(BlockError::Cancelled));
        assert!(matches!(merr.into_result(), Err(BlockError::Cancelled)));

        let err = join_errors(
            Err(BlockError::NoBlocksToMerge),
            Err(BlockError::corrupted("cleanup")),
        )
        .unwrap_err();
        let BlockError::Multiple(merr) = &err else {
            panic!("expected aggregated error, got {err}");
        };
        assert_eq!(merr.errors().len(), 2);
        assert!(err.to_string().contains("no blocks to merge"));
        assert!(err.to_string().contains("cleanup"));
    }

    #[test]
    fn context_and_shared_root() {
        let err = BlockError::ShardMergeMismatch.context("planning");
        assert_eq!(
            err.to_string(),
            "planning: only blocks from the same shard can be merged"
        );
        let shared = BlockError::Shared(Arc::new(err));
        assert!(matches!(shared.root(), BlockError::ShardMergeMismatch));
    }
}
