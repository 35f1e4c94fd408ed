use std::{path::Path, sync::Arc};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{
    rewrite::{DatasetIndexWriter, IndexRewriter, ProfilesWriter, SymbolsRewriter},
    CompactionStats, SampleObserver,
};
use crate::{
    bufferpool::estimate_page_buffer_size,
    dataset::Dataset,
    error::{join_errors, BlockError, MultiError},
    executor::TaskGroup,
    fs::{INDEX_FILE, PROFILES_FILE, SYMBOLS_FILE},
    meta::DatasetMeta,
    observability::log_debug,
    option::CompactionOptions,
    section::Section,
    stream::{dataset_rows, merge_row_profiles},
    writer::Writer,
};

const CANCEL_CHECK_INTERVAL: u64 = 1000;

const COMPACTED_SECTIONS: [Section; 3] = [Section::Profiles, Section::Tsdb, Section::Symbols];

struct SectionWriters {
    index: IndexRewriter,
    symbols: SymbolsRewriter,
    profiles: ProfilesWriter,
}

/// Merges every source dataset sharing a tenant and name into one dataset
/// of the output block.
pub(crate) struct DatasetCompaction {
    name: String,
    meta: DatasetMeta,
    datasets: Vec<Arc<Dataset>>,
    writers: Option<SectionWriters>,
    stats: CompactionStats,
}

impl DatasetCompaction {
    pub(crate) fn new(name: String, meta: DatasetMeta, datasets: Vec<Arc<Dataset>>) -> Self {
        Self {
            name,
            meta,
            datasets,
            writers: None,
            stats: CompactionStats::default(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    pub(crate) fn datasets(&self) -> &[Arc<Dataset>] {
        &self.datasets
    }

    pub(crate) fn stats(&self) -> CompactionStats {
        self.stats
    }

    /// Merge the source datasets and append the result to `writer`.
    ///
    /// Section files are staged in a working directory under the configured
    /// temp dir, which is removed whatever the outcome.
    pub(crate) async fn compact(
        &mut self,
        cancel: &CancellationToken,
        writer: &mut Writer,
        options: &CompactionOptions,
        ordinal: usize,
        dataset_index: Option<&mut DatasetIndexWriter>,
    ) -> Result<(), BlockError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("dataset-{ordinal}-"))
            .tempdir_in(&options.temp_dir)
            .map_err(|err| BlockError::from(err).context("creating working directory"))?;
        let observer = options.sample_observer.as_deref();
        let result = self
            .compact_in(cancel, writer, dir.path(), dataset_index, observer)
            .await;
        let removed = dir
            .close()
            .map_err(|err| BlockError::from(err).context("removing working directory"));
        join_errors(result, removed)
    }

    async fn compact_in(
        &mut self,
        cancel: &CancellationToken,
        writer: &mut Writer,
        dir: &Path,
        dataset_index: Option<&mut DatasetIndexWriter>,
        observer: Option<&dyn SampleObserver>,
    ) -> Result<(), BlockError> {
        self.open(cancel, dir)
            .await
            .map_err(|err| err.context("opening sections for compaction"))?;

        let mut merr = MultiError::new();
        merr.add(
            self.merge(cancel, dataset_index, observer)
                .await
                .map_err(|err| err.context("merging datasets")),
        );
        merr.add(
            self.flush(dir, observer)
                .await
                .map_err(|err| err.context("flushing compacted dataset")),
        );
        self.close(merr.into_result()).await?;

        self.write_to(writer, dir).await
    }

    async fn open(&mut self, cancel: &CancellationToken, dir: &Path) -> Result<(), BlockError> {
        let profiles_size = self
            .datasets
            .iter()
            .map(|ds| {
                ds.section_range(Section::Profiles)
                    .map(|range| range.end - range.start)
            })
            .sum::<Result<u64, BlockError>>()?;
        let page_buffer_size = estimate_page_buffer_size(profiles_size);
        let profiles = ProfilesWriter::create(&dir.join(PROFILES_FILE), page_buffer_size).await?;

        let mut group = TaskGroup::new(cancel);
        for (i, ds) in self.datasets.iter().enumerate() {
            let ds = ds.clone();
            let token = group.token();
            group.spawn(async move {
                ds.open(&token, &COMPACTED_SECTIONS).await.map_err(|err| {
                    err.context(format!("opening tenant dataset (block {})", ds.object().path()))
                })?;
                Ok(i)
            });
        }
        let (opened, err) = group.join().await;
        if let Some(err) = err {
            let mut merr = MultiError::new();
            merr.push(err);
            for i in opened {
                merr.add(self.datasets[i].close().await);
            }
            return merr.into_result();
        }

        self.writers = Some(SectionWriters {
            index: IndexRewriter::default(),
            symbols: SymbolsRewriter::new(self.datasets.clone()),
            profiles,
        });
        Ok(())
    }

    async fn merge(
        &mut self,
        cancel: &CancellationToken,
        mut dataset_index: Option<&mut DatasetIndexWriter>,
        observer: Option<&dyn SampleObserver>,
    ) -> Result<(), BlockError> {
        let streams = self
            .datasets
            .iter()
            .enumerate()
            .map(|(i, ds)| dataset_rows(i, ds))
            .collect::<Result<Vec<_>, _>>()?;
        let writers = self
            .writers
            .as_mut()
            .ok_or_else(|| BlockError::corrupted("dataset compaction is not open"))?;

        let mut rows = merge_row_profiles(streams);
        let mut n = 0u64;
        while let Some(entry) = rows.next().await {
            let mut entry = entry?;
            n += 1;
            if n % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(BlockError::Cancelled);
            }
            if let Some(index) = dataset_index.as_deref_mut() {
                index.write_row(&entry);
            }
            writers.index.rewrite_row(&mut entry);
            writers.symbols.rewrite_row(&mut entry)?;
            if let Some(observer) = observer {
                observer.observe(&self.name, &entry);
            }
            writers.profiles.write_row(entry.row).await?;
        }
        Ok(())
    }

    /// Finish the section files. Runs once; later calls are no-ops.
    async fn flush(
        &mut self,
        dir: &Path,
        observer: Option<&dyn SampleObserver>,
    ) -> Result<(), BlockError> {
        let Some(writers) = self.writers.take() else {
            return Ok(());
        };
        let mut merr = MultiError::new();
        match writers.symbols.flush(&dir.join(SYMBOLS_FILE)).await {
            Ok(samples) => self.stats.samples = samples,
            Err(err) => merr.push(err.context("flushing symbols")),
        }
        match writers.index.flush(&dir.join(INDEX_FILE)).await {
            Ok(series) => self.stats.series = series,
            Err(err) => merr.push(err.context("flushing index")),
        }
        match writers.profiles.close().await {
            Ok(profiles) => self.stats.profiles = profiles,
            Err(err) => merr.push(err.context("flushing profiles")),
        }
        if let Some(observer) = observer {
            observer.flush_symbols();
        }
        merr.into_result()
    }

    /// Release the source datasets. A failure poisons them with the very
    /// error returned to the caller.
    async fn close(&self, result: Result<(), BlockError>) -> Result<(), BlockError> {
        let err = result.err().map(Arc::new);
        let mut merr = MultiError::new();
        if let Some(err) = &err {
            merr.push(BlockError::Shared(err.clone()));
        }
        for ds in &self.datasets {
            merr.add(ds.close_with_error(err.clone()).await);
        }
        merr.into_result()
    }

    async fn write_to(&mut self, writer: &mut Writer, dir: &Path) -> Result<(), BlockError> {
        let start = writer.offset();
        let offsets = writer
            .read_from_files(dir, &[PROFILES_FILE, INDEX_FILE, SYMBOLS_FILE])
            .await
            .map_err(|err| err.context(format!("writing dataset {}", self.name)))?;
        self.meta.table_of_contents = offsets;
        self.meta.size = writer.offset() - start;
        log_debug!(
            component = "compaction",
            event = "dataset_compacted",
            dataset = %self.name,
            sources = self.datasets.len(),
            series = self.stats.series,
            profiles = self.stats.profiles,
            samples = self.stats.samples,
            size = self.meta.size,
        );
        Ok(())
    }
}
