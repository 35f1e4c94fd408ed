use std::sync::Arc;

use futures_core::future::BoxFuture;
use futures_util::FutureExt;

use super::{Section, SectionHandle, SectionOpener};
use crate::{dataset::Dataset, error::BlockError, symdb::SymDb};

pub(super) struct SymbolsOpener;

impl SectionOpener for SymbolsOpener {
    fn open(&self, dataset: Arc<Dataset>) -> BoxFuture<'static, Result<SectionHandle, BlockError>> {
        async move {
            let buf = dataset.read_section(Section::Symbols).await?;
            let symbols = SymDb::decode(&buf).await?;
            Ok(SectionHandle::Symbols(Arc::new(symbols)))
        }
        .boxed()
    }
}
