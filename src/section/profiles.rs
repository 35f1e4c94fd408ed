use std::sync::Arc;

use futures_core::future::BoxFuture;
use futures_util::FutureExt;

use super::{Section, SectionHandle, SectionOpener};
use crate::{dataset::Dataset, error::BlockError, fs::reader::SectionReader};

pub(super) struct ProfilesOpener;

impl SectionOpener for ProfilesOpener {
    fn open(&self, dataset: Arc<Dataset>) -> BoxFuture<'static, Result<SectionHandle, BlockError>> {
        async move {
            let range = dataset.section_range(Section::Profiles)?;
            let mut reader = SectionReader::new(dataset.source(), range);
            reader.load_metadata().await?;
            Ok(SectionHandle::Profiles(reader))
        }
        .boxed()
    }
}
