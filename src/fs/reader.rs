use std::{ops::Range, sync::Arc};

use bytes::Bytes;
use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use parquet::{
    arrow::async_reader::AsyncFileReader,
    file::{
        metadata::{ParquetMetaData, ParquetMetaDataReader},
        FOOTER_SIZE,
    },
};

use crate::{
    bufferpool::{estimate_footer_size, PooledBuffer},
    error::BlockError,
    object::Object,
};

/// Where the bytes of a dataset come from: its own in-memory copy, or the
/// parent object.
#[derive(Clone)]
pub(crate) enum ByteSource {
    Buffer {
        buf: Arc<PooledBuffer>,
        /// Object offset of the first buffered byte.
        offset: u64,
    },
    Object(Arc<Object>),
}

impl ByteSource {
    /// Read `range`, given as offsets within the object.
    pub(crate) async fn read(&self, range: Range<u64>) -> Result<Bytes, BlockError> {
        match self {
            ByteSource::Buffer { buf, offset } => {
                let (start, end) = range
                    .start
                    .checked_sub(*offset)
                    .zip(range.end.checked_sub(*offset))
                    .filter(|(start, end)| start <= end && *end <= buf.len() as u64)
                    .ok_or_else(|| {
                        BlockError::corrupted(format!(
                            "range {range:?} is outside of the buffered dataset"
                        ))
                    })?;
                Ok(Bytes::copy_from_slice(&buf[start as usize..end as usize]))
            }
            ByteSource::Object(object) => object.read_range(range).await,
        }
    }

    pub(crate) fn is_buffered(&self) -> bool {
        match self {
            ByteSource::Buffer { .. } => true,
            ByteSource::Object(object) => object.is_buffered(),
        }
    }
}

/// Parquet reader over one section of a block object.
///
/// Offsets requested by parquet are relative to the section. Loading the
/// metadata fetches an estimated footer in one read; the fetched tail is kept
/// and serves later reads that fall inside it.
#[derive(Clone)]
pub struct SectionReader {
    source: ByteSource,
    range: Range<u64>,
    tail: Option<(u64, Bytes)>,
    metadata: Option<Arc<ParquetMetaData>>,
}

impl SectionReader {
    pub(crate) fn new(source: ByteSource, range: Range<u64>) -> Self {
        Self {
            source,
            range,
            tail: None,
            metadata: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    async fn read(&self, range: Range<u64>) -> Result<Bytes, BlockError> {
        if range.end > self.size() {
            return Err(BlockError::corrupted(format!(
                "read {range:?} past the end of a section of {} bytes",
                self.size()
            )));
        }
        if let Some((start, tail)) = &self.tail {
            if range.start >= *start && range.end <= start + tail.len() as u64 {
                return Ok(tail.slice((range.start - start) as usize..(range.end - start) as usize));
            }
        }
        let base = self.range.start;
        self.source.read(base + range.start..base + range.end).await
    }

    pub(crate) async fn load_metadata(&mut self) -> Result<Arc<ParquetMetaData>, BlockError> {
        if let Some(metadata) = &self.metadata {
            return Ok(metadata.clone());
        }
        let size = self.size();
        let footer_size = FOOTER_SIZE as u64;
        if size < footer_size {
            return Err(BlockError::corrupted("parquet section is too small"));
        }
        let prefetch = if self.source.is_buffered() {
            footer_size
        } else {
            estimate_footer_size(size).max(footer_size)
        };
        let mut tail = self.read(size - prefetch..size).await?;

        let mut footer = [0u8; FOOTER_SIZE];
        footer.copy_from_slice(&tail[tail.len() - FOOTER_SIZE..]);
        let metadata_len = ParquetMetaDataReader::decode_footer(&footer)? as u64;
        let needed = metadata_len + footer_size;
        if needed > size {
            return Err(BlockError::corrupted(format!(
                "parquet metadata of {metadata_len} bytes exceeds the section size {size}"
            )));
        }
        if needed > prefetch {
            tail = self.read(size - needed..size).await?;
        }
        let start = tail.len() - needed as usize;
        let metadata = Arc::new(ParquetMetaDataReader::decode_metadata(
            &tail[start..tail.len() - FOOTER_SIZE],
        )?);

        self.tail = Some((size - tail.len() as u64, tail));
        self.metadata = Some(metadata.clone());
        Ok(metadata)
    }
}

impl AsyncFileReader for SectionReader {
    fn get_bytes(&mut self, range: Range<usize>) -> BoxFuture<'_, parquet::errors::Result<Bytes>> {
        async move { Ok(self.read(range.start as u64..range.end as u64).await?) }.boxed()
    }

    fn get_metadata(&mut self) -> BoxFuture<'_, parquet::errors::Result<Arc<ParquetMetaData>>> {
        async move { Ok(self.load_metadata().await?) }.boxed()
    }
}
