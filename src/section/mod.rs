//! Sections of a dataset and how each of them is opened.
//!
//! A dataset's table of contents holds one offset per section; the layout
//! depends on the dataset format. Opening is dispatched through
//! [`SectionOpener`], one implementation per section kind.

mod profiles;
mod symbols;
mod tsdb;

use std::{fmt, sync::Arc};

use futures_core::future::BoxFuture;

use crate::{
    dataset::Dataset, error::BlockError, fs::reader::SectionReader, meta::DATASET_FORMAT_V1,
    symdb::SymDb, tsdb::IndexReader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    Profiles,
    Tsdb,
    Symbols,
    /// Tenant-wide index of which dataset holds which series.
    DatasetIndex,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Profiles => write!(f, "profiles"),
            Section::Tsdb => write!(f, "tsdb"),
            Section::Symbols => write!(f, "symbols"),
            Section::DatasetIndex => write!(f, "dataset_index"),
        }
    }
}

const V1_SECTIONS: &[Section] = &[Section::Profiles, Section::Tsdb, Section::Symbols];
const V1_ANONYMOUS_SECTIONS: &[Section] = &[Section::DatasetIndex];

impl Section {
    /// Position of the section in a table of contents.
    pub fn toc_index(self, format: u32, anonymous: bool) -> Result<usize, BlockError> {
        let layout = match (format, anonymous) {
            (DATASET_FORMAT_V1, false) => V1_SECTIONS,
            (DATASET_FORMAT_V1, true) => V1_ANONYMOUS_SECTIONS,
            _ => &[],
        };
        layout
            .iter()
            .position(|s| *s == self)
            .ok_or(BlockError::SectionNotFound {
                section: self,
                format,
            })
    }

    pub(crate) fn opener(self) -> &'static dyn SectionOpener {
        match self {
            Section::Profiles => &profiles::ProfilesOpener,
            Section::Tsdb => &tsdb::TsdbOpener,
            Section::Symbols => &symbols::SymbolsOpener,
            Section::DatasetIndex => &tsdb::DatasetIndexOpener,
        }
    }
}

/// An opened section, stored by the dataset until it is released.
pub(crate) enum SectionHandle {
    Profiles(SectionReader),
    Tsdb(Arc<IndexReader>),
    Symbols(Arc<SymDb>),
    DatasetIndex(Arc<IndexReader>),
}

pub(crate) trait SectionOpener: Send + Sync {
    fn open(&self, dataset: Arc<Dataset>) -> BoxFuture<'static, Result<SectionHandle, BlockError>>;
}
