use std::sync::Arc;

use futures_core::future::BoxFuture;
use futures_util::FutureExt;

use super::{Section, SectionHandle, SectionOpener};
use crate::{dataset::Dataset, error::BlockError, tsdb::IndexReader};

pub(super) struct TsdbOpener;

impl SectionOpener for TsdbOpener {
    fn open(&self, dataset: Arc<Dataset>) -> BoxFuture<'static, Result<SectionHandle, BlockError>> {
        async move {
            let buf = dataset.read_section(Section::Tsdb).await?;
            let index = IndexReader::decode(&buf).await?;
            Ok(SectionHandle::Tsdb(Arc::new(index)))
        }
        .boxed()
    }
}

pub(super) struct DatasetIndexOpener;

impl SectionOpener for DatasetIndexOpener {
    fn open(&self, dataset: Arc<Dataset>) -> BoxFuture<'static, Result<SectionHandle, BlockError>> {
        async move {
            let buf = dataset.read_section(Section::DatasetIndex).await?;
            let index = IndexReader::decode(&buf).await?;
            Ok(SectionHandle::DatasetIndex(Arc::new(index)))
        }
        .boxed()
    }
}
