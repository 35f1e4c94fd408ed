//! Symbol database: stack traces grouped in partitions.
//!
//! Each partition interns frame names in its own string table and stores
//! stack traces as lists of string references. Profile samples refer to a
//! stack trace by `(partition, stacktrace id)`.

use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    io,
    io::Cursor,
    sync::Arc,
};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::BlockError,
    serdes::{Decode, Encode},
    strings::StringTable,
    tsdb::checked_body,
};

const SYMDB_MAGIC: &[u8; 4] = b"PSY1";

#[derive(Debug, Clone, Default)]
pub struct Partition {
    strings: StringTable,
    stacktraces: Vec<Vec<u32>>,
    lookup: HashMap<Vec<u32>, u32>,
}

impl Partition {
    /// Add a stack trace given as frame names, leaf first.
    pub fn add_stacktrace<S: AsRef<str>>(&mut self, frames: &[S]) -> u32 {
        let refs: Vec<u32> = frames
            .iter()
            .map(|frame| self.strings.put(frame.as_ref()) as u32)
            .collect();
        self.add_refs(refs)
    }

    fn add_refs(&mut self, refs: Vec<u32>) -> u32 {
        match self.lookup.entry(refs) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let id = self.stacktraces.len() as u32;
                self.stacktraces.push(entry.key().clone());
                entry.insert(id);
                id
            }
        }
    }

    /// Resolve a stack trace to its frame names.
    pub fn stacktrace(&self, id: u32) -> Option<Vec<&str>> {
        let refs = self.stacktraces.get(id as usize)?;
        refs.iter()
            .map(|&r| self.strings.lookup(r as i32))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stacktraces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacktraces.is_empty()
    }
}

/// An in-memory symbol database, used both to build and to read the
/// symbols section.
#[derive(Debug, Clone, Default)]
pub struct SymDb {
    partitions: BTreeMap<u64, Partition>,
}

impl SymDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, id: u64) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    pub fn partition_mut(&mut self, id: u64) -> &mut Partition {
        self.partitions.entry(id).or_default()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (u64, &Partition)> {
        self.partitions.iter().map(|(id, p)| (*id, p))
    }

    pub fn stacktrace_count(&self) -> usize {
        self.partitions.values().map(Partition::len).sum()
    }

    pub async fn encode(&self) -> Result<Vec<u8>, BlockError> {
        let mut buf = Vec::with_capacity(
            SYMDB_MAGIC.len() + 4 + self.partitions.values().map(|p| 8 + p.size()).sum::<usize>() + 4,
        );
        buf.extend_from_slice(SYMDB_MAGIC);
        (self.partitions.len() as u32).encode(&mut buf).await?;
        for (id, partition) in &self.partitions {
            id.encode(&mut buf).await?;
            partition.encode(&mut buf).await?;
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    pub async fn decode(buf: &[u8]) -> Result<Self, BlockError> {
        let mut cursor = Cursor::new(checked_body(buf, SYMDB_MAGIC)?);
        let count = u32::decode(&mut cursor).await?;
        let mut partitions = BTreeMap::new();
        for _ in 0..count {
            let id = u64::decode(&mut cursor).await?;
            let partition = decode_partition(&mut cursor)
                .await
                .map_err(|err| err.context(format!("decoding symbols partition {id}")))?;
            partitions.insert(id, partition);
        }
        Ok(SymDb { partitions })
    }
}

async fn decode_partition<R>(reader: &mut R) -> Result<Partition, BlockError>
where
    R: AsyncRead + Unpin + Send,
{
    let strings = StringTable::from_strings(Vec::decode(reader).await?)
        .ok_or_else(|| BlockError::corrupted("malformed partition string table"))?;
    let stacktraces: Vec<Vec<u32>> = Vec::decode(reader).await?;
    let mut lookup = HashMap::with_capacity(stacktraces.len());
    for (id, refs) in stacktraces.iter().enumerate() {
        if refs.iter().any(|&r| r as usize >= strings.len()) {
            return Err(BlockError::corrupted(format!(
                "stacktrace {id} refers to an unknown string"
            )));
        }
        lookup.insert(refs.clone(), id as u32);
    }
    Ok(Partition {
        strings,
        stacktraces,
        lookup,
    })
}

/// Translates stack trace ids of one source symbol database into the id
/// space of a target database, copying the stack traces it has not seen.
pub struct Rewriter {
    source: Arc<SymDb>,
    cache: HashMap<u64, HashMap<u32, u32>>,
}

impl Rewriter {
    pub fn new(source: Arc<SymDb>) -> Self {
        Self {
            source,
            cache: HashMap::new(),
        }
    }

    /// Rewrite `ids` of `partition` in place.
    pub fn rewrite(
        &mut self,
        target: &mut SymDb,
        partition: u64,
        ids: &mut [u32],
    ) -> Result<(), BlockError> {
        let source = self.source.partition(partition).ok_or_else(|| {
            BlockError::corrupted(format!("unknown stacktrace partition {partition}"))
        })?;
        let cache = self.cache.entry(partition).or_default();
        let target = target.partition_mut(partition);
        for id in ids.iter_mut() {
            if let Some(mapped) = cache.get(id) {
                *id = *mapped;
                continue;
            }
            let frames = source.stacktrace(*id).ok_or_else(|| {
                BlockError::corrupted(format!(
                    "unknown stacktrace {id} in partition {partition}"
                ))
            })?;
            let mapped = target.add_stacktrace(frames.as_slice());
            cache.insert(*id, mapped);
            *id = mapped;
        }
        Ok(())
    }
}

impl Encode for Partition {
    async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let strings = self.strings.strings();
        (strings.len() as u32).encode(writer).await?;
        for s in strings {
            s.encode(writer).await?;
        }
        self.stacktraces.encode(writer).await
    }

    fn size(&self) -> usize {
        self.strings.strings().iter().map(|s| s.size()).sum::<usize>()
            + 4
            + self.stacktraces.size()
    }
}
