//! Runtime view of one tenant dataset within a block object.

use std::{fmt, ops::Range, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    bufferpool::PooledBuffer,
    error::BlockError,
    executor::TaskGroup,
    fs::reader::{ByteSource, SectionReader},
    meta::DatasetMeta,
    object::{Object, RefCounter},
    observability::log_warn,
    section::{Section, SectionHandle},
    symdb::SymDb,
    tsdb::IndexReader,
};

#[derive(Default)]
struct DatasetState {
    buffer: Option<Arc<PooledBuffer>>,
    profiles: Option<SectionReader>,
    index: Option<Arc<IndexReader>>,
    symbols: Option<Arc<SymDb>>,
    dataset_index: Option<Arc<IndexReader>>,
}

/// A dataset of a block object, addressable by section.
///
/// Sections are only available between a successful [`Dataset::open`] and
/// the matching close. Opening a dataset opens its parent object; the last
/// close of the dataset releases it.
pub struct Dataset {
    meta: DatasetMeta,
    object: Arc<Object>,
    refs: RefCounter,
    state: RwLock<DatasetState>,
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name())
            .field("tenant", &self.tenant())
            .field("object", &self.object.path())
            .finish()
    }
}

impl Dataset {
    pub fn new(meta: DatasetMeta, object: Arc<Object>) -> Self {
        Self {
            meta,
            object,
            refs: RefCounter::default(),
            state: RwLock::new(DatasetState::default()),
        }
    }

    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    pub fn name(&self) -> &str {
        self.object.meta().string(self.meta.name)
    }

    pub fn tenant(&self) -> &str {
        self.object.meta().string(self.meta.tenant)
    }

    /// Anonymous datasets carry tenant-wide data rather than profiles.
    pub fn is_anonymous(&self) -> bool {
        self.name().is_empty()
    }

    /// Byte range of a section within the object.
    pub fn section_range(&self, section: Section) -> Result<Range<u64>, BlockError> {
        let toc = &self.meta.table_of_contents;
        let i = section.toc_index(self.meta.format, self.is_anonymous())?;
        let start = *toc.get(i).ok_or(BlockError::SectionNotFound {
            section,
            format: self.meta.format,
        })?;
        let end = toc.get(i + 1).copied().unwrap_or_else(|| self.meta.end());
        if end < start {
            return Err(BlockError::corrupted(format!(
                "section {section} of dataset {} ends before it starts",
                self.name()
            )));
        }
        Ok(start..end)
    }

    pub(crate) fn source(&self) -> ByteSource {
        match &self.state.read().buffer {
            Some(buf) => ByteSource::Buffer {
                buf: buf.clone(),
                offset: self.meta.table_of_contents.first().copied().unwrap_or(0),
            },
            None => ByteSource::Object(self.object.clone()),
        }
    }

    pub(crate) async fn read_section(&self, section: Section) -> Result<Bytes, BlockError> {
        let range = self.section_range(section)?;
        self.source().read(range).await
    }

    fn describe(&self) -> String {
        format!("dataset {} in object {}", self.name(), self.object.path())
    }

    /// Open the parent object, then the requested sections concurrently.
    ///
    /// Concurrent and repeated opens only count references; the sections
    /// requested by the first open are the ones loaded.
    pub async fn open(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        sections: &[Section],
    ) -> Result<(), BlockError> {
        self.refs
            .inc(move || async move {
                self.object.open(cancel).await?;
                if let Err(err) = self.open_sections(cancel, sections).await {
                    *self.state.write() = DatasetState::default();
                    if let Err(close_err) = self.object.close().await {
                        log_warn!(
                            component = "dataset",
                            event = "object_close_failed",
                            object = %self.object.path(),
                            error = %close_err,
                        );
                    }
                    return Err(err);
                }
                Ok(())
            })
            .await
    }

    async fn open_sections(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        sections: &[Section],
    ) -> Result<(), BlockError> {
        if cancel.is_cancelled() {
            return Err(BlockError::Cancelled);
        }
        if self.meta.size < self.object.options().memory_threshold && !self.object.is_buffered() {
            let start = self.meta.table_of_contents.first().copied().ok_or_else(|| {
                BlockError::corrupted(format!("{} has no sections", self.describe()))
            })?;
            let bytes = self
                .object
                .read_range(start..self.meta.end())
                .await
                .map_err(|err| err.context(format!("reading {}", self.describe())))?;
            let mut buf = PooledBuffer::get(bytes.len());
            buf.extend_from_slice(&bytes);
            self.state.write().buffer = Some(Arc::new(buf));
        }

        let mut group = TaskGroup::new(cancel);
        for &section in sections {
            let dataset = self.clone();
            let token = group.token();
            group.spawn(async move {
                if token.is_cancelled() {
                    return Err(BlockError::Cancelled);
                }
                section
                    .opener()
                    .open(dataset.clone())
                    .await
                    .map_err(|err| {
                        err.context(format!("opening section {section} of {}", dataset.describe()))
                    })
            });
        }
        let handles = group.wait().await?;

        let mut state = self.state.write();
        for handle in handles {
            match handle {
                SectionHandle::Profiles(reader) => state.profiles = Some(reader),
                SectionHandle::Tsdb(index) => state.index = Some(index),
                SectionHandle::Symbols(symbols) => state.symbols = Some(symbols),
                SectionHandle::DatasetIndex(index) => state.dataset_index = Some(index),
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), BlockError> {
        self.close_with_error(None).await
    }

    /// Release a reference, closing the parent object with the last one.
    /// With an error, the dataset is poisoned: later opens fail with it.
    pub async fn close_with_error(&self, err: Option<Arc<BlockError>>) -> Result<(), BlockError> {
        let object_err = err.clone();
        self.refs
            .dec(err, move || async move {
                *self.state.write() = DatasetState::default();
                self.object.close_with_error(object_err).await
            })
            .await
    }

    pub fn profiles(&self) -> Result<SectionReader, BlockError> {
        self.state
            .read()
            .profiles
            .clone()
            .ok_or(BlockError::SectionNotOpen(Section::Profiles))
    }

    pub fn index(&self) -> Result<Arc<IndexReader>, BlockError> {
        self.state
            .read()
            .index
            .clone()
            .ok_or(BlockError::SectionNotOpen(Section::Tsdb))
    }

    pub fn symbols(&self) -> Result<Arc<SymDb>, BlockError> {
        self.state
            .read()
            .symbols
            .clone()
            .ok_or(BlockError::SectionNotOpen(Section::Symbols))
    }

    pub fn dataset_index(&self) -> Result<Arc<IndexReader>, BlockError> {
        self.state
            .read()
            .dataset_index
            .clone()
            .ok_or(BlockError::SectionNotOpen(Section::DatasetIndex))
    }

    /// Whether the dataset holds its own copy of its bytes.
    pub fn is_buffered(&self) -> bool {
        self.state.read().buffer.is_some()
    }
}
