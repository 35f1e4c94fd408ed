use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    path::Path,
    sync::Arc,
};

use parquet::{
    arrow::AsyncArrowWriter,
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};

use crate::{
    dataset::Dataset,
    error::BlockError,
    schema::{profile_schema, rows_to_batch, ProfileRow},
    stream::ProfileEntry,
    symdb::{Rewriter, SymDb},
    tsdb::{ChunkMeta, IndexWriter, Labels},
};

const MAX_ROW_GROUP_SIZE: usize = 10240;
const ROW_BATCH_SIZE: usize = 1024;

/// Series of a time index in the order they are first seen, one chunk each.
#[derive(Default)]
pub(crate) struct SeriesTable {
    series: Vec<(Arc<Labels>, ChunkMeta)>,
    symbols: BTreeSet<String>,
    previous: Option<u64>,
}

impl SeriesTable {
    /// Chunk of the series `entry` belongs to. A fingerprint different from
    /// the previous row's starts a new series whose chunk points at
    /// `series_index`.
    pub(crate) fn observe(&mut self, entry: &ProfileEntry, series_index: u32) -> &mut ChunkMeta {
        if self.previous != Some(entry.fingerprint) || self.series.is_empty() {
            for label in entry.labels.iter() {
                self.symbols.insert(label.name.clone());
                self.symbols.insert(label.value.clone());
            }
            self.series.push((
                entry.labels.clone(),
                ChunkMeta {
                    min_time: entry.timestamp(),
                    max_time: entry.timestamp(),
                    series_index,
                },
            ));
            self.previous = Some(entry.fingerprint);
        }
        let last = self.series.len() - 1;
        &mut self.series[last].1
    }

    /// Forget the previous row so the next one starts a new series.
    pub(crate) fn reset_previous(&mut self) {
        self.previous = None;
    }

    pub(crate) fn len(&self) -> usize {
        self.series.len()
    }

    pub(crate) async fn encode(self) -> Result<Vec<u8>, BlockError> {
        let mut writer = IndexWriter::new();
        for symbol in &self.symbols {
            writer.add_symbol(symbol)?;
        }
        for (labels, chunk) in &self.series {
            writer.add_series(labels, *chunk)?;
        }
        writer.finish().await
    }
}

/// Renumbers the series of merged rows and builds the new time index.
#[derive(Default)]
pub(crate) struct IndexRewriter {
    table: SeriesTable,
}

impl IndexRewriter {
    pub(crate) fn rewrite_row(&mut self, entry: &mut ProfileEntry) {
        let next = self.table.len() as u32;
        let chunk = self.table.observe(entry, next);
        chunk.max_time = entry.timestamp();
        entry.row.series_index = chunk.series_index;
    }

    pub(crate) fn series_count(&self) -> u64 {
        self.table.len() as u64
    }

    pub(crate) async fn encode(self) -> Result<Vec<u8>, BlockError> {
        self.table.encode().await
    }

    /// Write the index to `path`, returning the number of series.
    pub(crate) async fn flush(self, path: &Path) -> Result<u64, BlockError> {
        let series = self.series_count();
        let buf = self.encode().await?;
        tokio::fs::write(path, buf).await?;
        Ok(series)
    }
}

/// Moves the stack traces referenced by merged rows into one symbol database.
pub(crate) struct SymbolsRewriter {
    target: SymDb,
    sources: Vec<Arc<Dataset>>,
    rewriters: HashMap<usize, Rewriter>,
    samples: u64,
}

impl SymbolsRewriter {
    pub(crate) fn new(sources: Vec<Arc<Dataset>>) -> Self {
        Self {
            target: SymDb::new(),
            sources,
            rewriters: HashMap::new(),
            samples: 0,
        }
    }

    pub(crate) fn rewrite_row(&mut self, entry: &mut ProfileEntry) -> Result<(), BlockError> {
        let rewriter = match self.rewriters.entry(entry.source) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let dataset = self.sources.get(entry.source).ok_or_else(|| {
                    BlockError::corrupted(format!("row from unknown dataset {}", entry.source))
                })?;
                e.insert(Rewriter::new(dataset.symbols()?))
            }
        };
        let row = &mut entry.row;
        rewriter.rewrite(
            &mut self.target,
            row.stacktrace_partition,
            &mut row.stacktrace_ids,
        )?;
        self.samples += row.stacktrace_ids.len() as u64;
        Ok(())
    }

    /// Write the symbol database to `path`, returning the number of samples.
    pub(crate) async fn flush(self, path: &Path) -> Result<u64, BlockError> {
        let buf = self.target.encode().await?;
        tokio::fs::write(path, buf).await?;
        Ok(self.samples)
    }
}

/// Time index of a tenant in which every series points at the ordinal of the
/// dataset holding it, rather than at a series of its own.
#[derive(Default)]
pub(crate) struct DatasetIndexWriter {
    table: SeriesTable,
    dataset: u32,
}

impl DatasetIndexWriter {
    pub(crate) fn set_dataset(&mut self, ordinal: u32) {
        self.dataset = ordinal;
        self.table.reset_previous();
    }

    pub(crate) fn write_row(&mut self, entry: &ProfileEntry) {
        let chunk = self.table.observe(entry, self.dataset);
        chunk.min_time = chunk.min_time.min(entry.timestamp());
        chunk.max_time = chunk.max_time.max(entry.timestamp());
    }

    pub(crate) async fn finish(self) -> Result<Vec<u8>, BlockError> {
        self.table.encode().await
    }
}

pub(crate) fn writer_properties(page_buffer_size: usize) -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_max_row_group_size(MAX_ROW_GROUP_SIZE)
        .set_data_page_size_limit(page_buffer_size)
        .build()
}

/// Appends rewritten rows to a new profile table.
pub(crate) struct ProfilesWriter {
    writer: AsyncArrowWriter<tokio::fs::File>,
    rows: Vec<ProfileRow>,
    profiles: u64,
}

impl ProfilesWriter {
    pub(crate) async fn create(path: &Path, page_buffer_size: usize) -> Result<Self, BlockError> {
        let file = tokio::fs::File::create(path).await?;
        let writer = AsyncArrowWriter::try_new(
            file,
            profile_schema().clone(),
            Some(writer_properties(page_buffer_size)),
        )?;
        Ok(Self {
            writer,
            rows: Vec::with_capacity(ROW_BATCH_SIZE),
            profiles: 0,
        })
    }

    pub(crate) async fn write_row(&mut self, row: ProfileRow) -> Result<(), BlockError> {
        self.rows.push(row);
        self.profiles += 1;
        if self.rows.len() >= ROW_BATCH_SIZE {
            self.write_rows().await?;
        }
        Ok(())
    }

    async fn write_rows(&mut self) -> Result<(), BlockError> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let batch = rows_to_batch(&self.rows)?;
        self.rows.clear();
        self.writer.write(&batch).await?;
        Ok(())
    }

    /// Finish the table, returning the number of profiles written.
    pub(crate) async fn close(mut self) -> Result<u64, BlockError> {
        self.write_rows().await?;
        self.writer.close().await?;
        Ok(self.profiles)
    }
}
