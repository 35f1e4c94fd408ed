//! Block and dataset metadata.
//!
//! All string-valued fields are references into the block's string table.
//! Blocks written by this crate end with the encoded [`BlockMeta`] followed by
//! a fixed trailer, so a block object can be opened without an external
//! metadata store.

use std::{io, io::Cursor, mem::size_of};

use object_store::{path::Path, ObjectStore};
use tokio::io::{AsyncRead, AsyncWrite};
use ulid::Ulid;

use crate::{
    error::BlockError,
    serdes::{encode_to_vec, invalid_data, Decode, Encode},
    strings::label_sets,
};

pub const BLOCK_FORMAT_VERSION: u32 = 1;
pub const DATASET_FORMAT_V1: u32 = 1;

/// Label set marking the tenant-wide dataset index.
pub const LABEL_NAME_TENANT_DATASET: &str = "__tenant_dataset__";
pub const LABEL_VALUE_DATASET_TSDB_INDEX: &str = "dataset_tsdb_index";

const TRAILER_MAGIC: &[u8; 4] = b"PBM1";
/// Metadata length, checksum and magic.
pub const TRAILER_SIZE: usize = size_of::<u32>() * 2 + TRAILER_MAGIC.len();

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockMeta {
    pub format_version: u32,
    pub id: String,
    pub tenant: i32,
    pub shard: u32,
    pub compaction_level: u32,
    pub min_time: i64,
    pub max_time: i64,
    /// Size of the whole block object in bytes.
    pub size: u64,
    pub metadata_offset: u64,
    pub datasets: Vec<DatasetMeta>,
    pub string_table: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatasetMeta {
    pub format: u32,
    pub tenant: i32,
    pub name: i32,
    pub min_time: i64,
    pub max_time: i64,
    /// Offsets of the dataset sections, relative to the block object.
    pub table_of_contents: Vec<u64>,
    pub size: u64,
    pub profile_types: Vec<i32>,
    /// Label sets of the dataset: `[n, name, value, ..., n, ...]`.
    pub labels: Vec<i32>,
}

impl BlockMeta {
    /// Resolve a string reference; unknown references resolve to "".
    pub fn string(&self, i: i32) -> &str {
        usize::try_from(i)
            .ok()
            .and_then(|i| self.string_table.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn tenant_name(&self) -> &str {
        self.string(self.tenant)
    }

    /// Label sets of a dataset of this block.
    pub fn dataset_labels(&self, ds: &DatasetMeta) -> Result<Vec<Vec<(&str, &str)>>, BlockError> {
        label_sets(&ds.labels, &self.string_table)
    }

    pub fn ulid(&self) -> Result<Ulid, BlockError> {
        Ok(Ulid::from_string(&self.id)?)
    }

    /// Check the invariants every block read from storage must satisfy.
    pub fn validate(&self) -> Result<(), BlockError> {
        if self.string_table.first().map(String::as_str) != Some("") {
            return Err(BlockError::corrupted(format!(
                "block {}: string table must start with an empty string",
                self.id
            )));
        }
        let mut previous = None;
        for ds in &self.datasets {
            if ds.table_of_contents.is_empty() {
                return Err(BlockError::corrupted(format!(
                    "block {}: dataset {} has an empty table of contents",
                    self.id,
                    self.string(ds.name)
                )));
            }
            for &off in &ds.table_of_contents {
                if previous.is_some_and(|p| off <= p) {
                    return Err(BlockError::corrupted(format!(
                        "block {}: table of contents offsets must be strictly increasing",
                        self.id
                    )));
                }
                previous = Some(off);
            }
            self.dataset_labels(ds).map_err(|err| {
                err.context(format!("block {}: dataset {}", self.id, self.string(ds.name)))
            })?;
            if ds.table_of_contents[0]
                .checked_add(ds.size)
                .map_or(true, |end| end > self.size)
            {
                return Err(BlockError::corrupted(format!(
                    "block {}: dataset {} exceeds the block size",
                    self.id,
                    self.string(ds.name)
                )));
            }
        }
        Ok(())
    }
}

impl DatasetMeta {
    /// Offset of the first byte past the dataset.
    pub fn end(&self) -> u64 {
        self.table_of_contents
            .first()
            .copied()
            .unwrap_or(0)
            .saturating_add(self.size)
    }
}

impl Encode for DatasetMeta {
    async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.format.encode(writer).await?;
        self.tenant.encode(writer).await?;
        self.name.encode(writer).await?;
        self.min_time.encode(writer).await?;
        self.max_time.encode(writer).await?;
        self.table_of_contents.encode(writer).await?;
        self.size.encode(writer).await?;
        self.profile_types.encode(writer).await?;
        self.labels.encode(writer).await
    }

    fn size(&self) -> usize {
        self.format.size()
            + self.tenant.size()
            + self.name.size()
            + self.min_time.size()
            + self.max_time.size()
            + self.table_of_contents.size()
            + self.size.size()
            + self.profile_types.size()
            + self.labels.size()
    }
}

impl Decode for DatasetMeta {
    async fn decode<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        Ok(DatasetMeta {
            format: u32::decode(reader).await?,
            tenant: i32::decode(reader).await?,
            name: i32::decode(reader).await?,
            min_time: i64::decode(reader).await?,
            max_time: i64::decode(reader).await?,
            table_of_contents: Vec::decode(reader).await?,
            size: u64::decode(reader).await?,
            profile_types: Vec::decode(reader).await?,
            labels: Vec::decode(reader).await?,
        })
    }
}

impl Encode for BlockMeta {
    async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.format_version.encode(writer).await?;
        self.id.encode(writer).await?;
        self.tenant.encode(writer).await?;
        self.shard.encode(writer).await?;
        self.compaction_level.encode(writer).await?;
        self.min_time.encode(writer).await?;
        self.max_time.encode(writer).await?;
        self.size.encode(writer).await?;
        self.metadata_offset.encode(writer).await?;
        self.datasets.encode(writer).await?;
        self.string_table.encode(writer).await
    }

    fn size(&self) -> usize {
        self.format_version.size()
            + self.id.size()
            + self.tenant.size()
            + self.shard.size()
            + self.compaction_level.size()
            + self.min_time.size()
            + self.max_time.size()
            + self.size.size()
            + self.metadata_offset.size()
            + self.datasets.size()
            + self.string_table.size()
    }
}

impl Decode for BlockMeta {
    async fn decode<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        Ok(BlockMeta {
            format_version: u32::decode(reader).await?,
            id: String::decode(reader).await?,
            tenant: i32::decode(reader).await?,
            shard: u32::decode(reader).await?,
            compaction_level: u32::decode(reader).await?,
            min_time: i64::decode(reader).await?,
            max_time: i64::decode(reader).await?,
            size: u64::decode(reader).await?,
            metadata_offset: u64::decode(reader).await?,
            datasets: Vec::decode(reader).await?,
            string_table: Vec::decode(reader).await?,
        })
    }
}

/// Encode `meta` followed by the block trailer.
///
/// `meta.size` is expected to already account for the returned bytes.
pub async fn encode_with_trailer(meta: &BlockMeta) -> io::Result<Vec<u8>> {
    let mut buf = encode_to_vec(meta).await?;
    let len = u32::try_from(buf.len()).map_err(|_| invalid_data("block metadata is too large"))?;
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(TRAILER_MAGIC);
    Ok(buf)
}

/// Size of the encoded metadata plus trailer, used to precompute `BlockMeta::size`.
pub(crate) fn encoded_len(meta: &BlockMeta) -> u64 {
    (meta.size() + TRAILER_SIZE) as u64
}

fn decode_trailer(trailer: &[u8]) -> Result<(u32, u32), BlockError> {
    if trailer.len() != TRAILER_SIZE || &trailer[8..] != TRAILER_MAGIC {
        return Err(BlockError::corrupted("block trailer magic mismatch"));
    }
    let len = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let crc = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    Ok((len, crc))
}

/// Decode metadata from its bytes and the checksum stored in the trailer.
pub async fn decode_checked(buf: &[u8], crc: u32) -> Result<BlockMeta, BlockError> {
    if crc32fast::hash(buf) != crc {
        return Err(BlockError::corrupted("block metadata checksum mismatch"));
    }
    let meta = BlockMeta::decode(&mut Cursor::new(buf)).await?;
    meta.validate()?;
    Ok(meta)
}

/// Read the metadata of a block object from the object itself.
pub async fn read_block_meta(storage: &dyn ObjectStore, path: &Path) -> Result<BlockMeta, BlockError> {
    let size = storage.head(path).await?.size;
    if size < TRAILER_SIZE {
        return Err(BlockError::corrupted(format!("object {path} is too small to be a block")));
    }
    let trailer = storage.get_range(path, size - TRAILER_SIZE..size).await?;
    let (len, crc) = decode_trailer(&trailer)?;
    let end = size - TRAILER_SIZE;
    let start = end
        .checked_sub(len as usize)
        .ok_or_else(|| BlockError::corrupted(format!("object {path}: metadata length out of range")))?;
    let buf = storage.get_range(path, start..end).await?;
    decode_checked(&buf, crc)
        .await
        .map_err(|err| err.context(format!("reading metadata of {path}")))
}
