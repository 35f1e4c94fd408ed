//! Series labels and the per-dataset time index.
//!
//! The index maps every series of a dataset to its label set and a single
//! chunk covering the series' time range. Profile rows refer to series by
//! their position in the index.

use std::{collections::HashMap, fmt, io, io::Cursor, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};
use xxhash_rust::xxh64::Xxh64;

use crate::{
    error::BlockError,
    serdes::{invalid_data, Decode, Encode},
};

const INDEX_MAGIC: &[u8; 4] = b"PIX1";
const LABEL_SEPARATOR: [u8; 1] = [0xff];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// A label set sorted by name.
///
/// Label sets order pairwise by name, then value; a set that is a prefix of
/// another sorts first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = pairs
            .into_iter()
            .map(|(name, value)| Label {
                name: name.into(),
                value: value.into(),
            })
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Labels(labels)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|label| label.name == name)
            .map(|label| label.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        for label in &self.0 {
            hasher.update(label.name.as_bytes());
            hasher.update(&LABEL_SEPARATOR);
            hasher.update(label.value.as_bytes());
            hasher.update(&LABEL_SEPARATOR);
        }
        hasher.digest()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}=\"{}\"", label.name, label.value)?;
        }
        f.write_str("}")
    }
}

/// Time range of a series and the position its rows refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkMeta {
    pub min_time: i64,
    pub max_time: i64,
    pub series_index: u32,
}

impl Encode for ChunkMeta {
    async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.min_time.encode(writer).await?;
        self.max_time.encode(writer).await?;
        self.series_index.encode(writer).await
    }

    fn size(&self) -> usize {
        self.min_time.size() + self.max_time.size() + self.series_index.size()
    }
}

impl Decode for ChunkMeta {
    async fn decode<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        Ok(ChunkMeta {
            min_time: i64::decode(reader).await?,
            max_time: i64::decode(reader).await?,
            series_index: u32::decode(reader).await?,
        })
    }
}

#[derive(Debug)]
struct EncodedSeries {
    /// Name and value symbol references, alternating.
    refs: Vec<u32>,
    fingerprint: u64,
    chunk: ChunkMeta,
}

impl Encode for EncodedSeries {
    async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.refs.encode(writer).await?;
        self.fingerprint.encode(writer).await?;
        self.chunk.encode(writer).await
    }

    fn size(&self) -> usize {
        self.refs.size() + self.fingerprint.size() + self.chunk.size()
    }
}

impl Decode for EncodedSeries {
    async fn decode<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        Ok(EncodedSeries {
            refs: Vec::decode(reader).await?,
            fingerprint: u64::decode(reader).await?,
            chunk: ChunkMeta::decode(reader).await?,
        })
    }
}

/// Builds a time index.
///
/// Symbols must be added first, in strictly increasing order; series may
/// only use symbols that were added.
#[derive(Debug, Default)]
pub struct IndexWriter {
    symbols: Vec<String>,
    symbol_refs: HashMap<String, u32>,
    series: Vec<EncodedSeries>,
}

impl IndexWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_symbol(&mut self, symbol: &str) -> Result<(), BlockError> {
        if let Some(last) = self.symbols.last() {
            if last.as_str() >= symbol {
                return Err(BlockError::corrupted(format!(
                    "index symbol {symbol:?} added out of order after {last:?}"
                )));
            }
        }
        let id = self.symbols.len() as u32;
        self.symbols.push(symbol.to_string());
        self.symbol_refs.insert(symbol.to_string(), id);
        Ok(())
    }

    pub fn add_series(&mut self, labels: &Labels, chunk: ChunkMeta) -> Result<(), BlockError> {
        let mut refs = Vec::with_capacity(labels.len() * 2);
        for label in labels.iter() {
            for symbol in [&label.name, &label.value] {
                let id = self.symbol_refs.get(symbol.as_str()).ok_or_else(|| {
                    BlockError::corrupted(format!("index series uses unknown symbol {symbol:?}"))
                })?;
                refs.push(*id);
            }
        }
        self.series.push(EncodedSeries {
            refs,
            fingerprint: labels.fingerprint(),
            chunk,
        });
        Ok(())
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub async fn finish(self) -> Result<Vec<u8>, BlockError> {
        let mut buf = Vec::with_capacity(
            INDEX_MAGIC.len() + self.symbols.size() + self.series.size() + 4,
        );
        buf.extend_from_slice(INDEX_MAGIC);
        self.symbols.encode(&mut buf).await?;
        self.series.encode(&mut buf).await?;
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

#[derive(Debug, Clone)]
pub struct Series {
    pub labels: Arc<Labels>,
    pub fingerprint: u64,
    pub chunk: ChunkMeta,
}

/// A decoded time index.
#[derive(Debug, Default)]
pub struct IndexReader {
    symbols: Vec<String>,
    series: Vec<Series>,
}

impl IndexReader {
    pub async fn decode(buf: &[u8]) -> Result<Self, BlockError> {
        let body = checked_body(buf, INDEX_MAGIC)?;
        let mut cursor = Cursor::new(body);
        let symbols: Vec<String> = Vec::decode(&mut cursor).await?;
        let encoded: Vec<EncodedSeries> = Vec::decode(&mut cursor).await?;

        let mut series = Vec::with_capacity(encoded.len());
        for s in encoded {
            if s.refs.len() % 2 != 0 {
                return Err(invalid_data("odd number of label references").into());
            }
            let mut pairs = Vec::with_capacity(s.refs.len() / 2);
            for pair in s.refs.chunks_exact(2) {
                let name = lookup_symbol(&symbols, pair[0])?;
                let value = lookup_symbol(&symbols, pair[1])?;
                pairs.push((name, value));
            }
            series.push(Series {
                labels: Arc::new(Labels::new(pairs)),
                fingerprint: s.fingerprint,
                chunk: s.chunk,
            });
        }
        Ok(IndexReader { symbols, series })
    }

    pub fn series(&self, i: u32) -> Option<&Series> {
        self.series.get(i as usize)
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn iter(&self) -> impl Iterator<Item = &Series> {
        self.series.iter()
    }
}

fn lookup_symbol(symbols: &[String], id: u32) -> Result<&str, BlockError> {
    symbols
        .get(id as usize)
        .map(String::as_str)
        .ok_or_else(|| BlockError::corrupted(format!("index symbol reference {id} out of range")))
}

/// Verify magic prefix and trailing crc32, returning the payload between them.
pub(crate) fn checked_body<'a>(buf: &'a [u8], magic: &[u8; 4]) -> Result<&'a [u8], BlockError> {
    if buf.len() < magic.len() + 4 || &buf[..magic.len()] != magic {
        return Err(BlockError::corrupted("section magic mismatch"));
    }
    let (content, crc) = buf.split_at(buf.len() - 4);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    if crc32fast::hash(content) != expected {
        return Err(BlockError::corrupted("section checksum mismatch"));
    }
    Ok(&content[magic.len()..])
}
